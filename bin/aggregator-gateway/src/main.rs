use aggregator_proxy::{ProxyMetrics, RequestForwarder, ServingCertificate};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod registry;
mod resolver;
mod server;

use config::{GatewayConfig, LogFormat};
use controller::ApiServiceController;
use registry::ApiServiceRegistry;
use resolver::RequestHeaderResolver;
use server::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(config.log_format);

    info!("Starting aggregator-gateway...");

    let metrics = Arc::new(ProxyMetrics::new()?);
    let forwarder = Arc::new(RequestForwarder::new(config.forwarder_config()));
    info!(
        "Request forwarder initialized with {:?} connect timeout",
        forwarder.config().connect_timeout
    );

    let resolver = Arc::new(RequestHeaderResolver::new(&config.identity)?);
    let registry = Arc::new(
        ApiServiceRegistry::new(resolver, forwarder).with_metrics(metrics.clone()),
    );
    let gateway = Arc::new(Gateway::new(registry.clone(), metrics));

    let client = kube::Client::try_default().await?;
    let controller = ApiServiceController::new(client, registry);
    tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("APIService controller error: {}", e);
        }
    });

    match &config.tls {
        Some(tls) => {
            let acceptor = TlsAcceptor::from(
                ServingCertificate::from_files(&tls.cert, &tls.key)?.server_config()?,
            );
            let listener = TcpListener::bind(config.https_addr).await?;
            info!("HTTPS server listening on {}", config.https_addr);
            tokio::spawn(server::accept_https(listener, gateway.clone(), acceptor));
        }
        None => {
            warn!("TLS not configured - HTTPS listener not started");
            warn!("Set AGGREGATOR_TLS_CERT and AGGREGATOR_TLS_KEY environment variables to enable HTTPS");
        }
    }

    if let Some(http_addr) = config.http_addr {
        let listener = TcpListener::bind(http_addr).await?;
        info!("HTTP server listening on {}", http_addr);
        tokio::spawn(server::accept_http(listener, gateway));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
