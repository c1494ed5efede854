//! Listeners and local endpoints

use crate::registry::ApiServiceRegistry;
use aggregator_proxy::error::BoxError;
use aggregator_proxy::{InboundScheme, ProxyBody, ProxyMetrics};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Serves `/healthz` and `/metrics` locally and everything else through the registry
pub struct Gateway {
    registry: Arc<ApiServiceRegistry>,
    metrics: Arc<ProxyMetrics>,
}

impl Gateway {
    pub fn new(registry: Arc<ApiServiceRegistry>, metrics: Arc<ProxyMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = request.uri().path();

        if path == "/healthz" {
            return text(StatusCode::OK, "OK\n".to_string());
        }

        if path == "/metrics" && request.method() == Method::GET {
            return match self.metrics.gather() {
                Ok(metrics) => {
                    let mut response = text(StatusCode::OK, metrics);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => {
                    warn!("Failed to gather metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n".to_string())
                }
            };
        }

        self.registry.dispatch(request).await
    }
}

fn text(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
}

/// Accept plain HTTP connections
pub async fn accept_http(listener: TcpListener, gateway: Arc<Gateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let gateway = gateway.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = serve(stream, gateway, InboundScheme::Http).await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => warn!("Error accepting HTTP connection: {}", e),
        }
    }
}

/// Accept HTTPS connections with TLS
pub async fn accept_https(listener: TcpListener, gateway: Arc<Gateway>, tls_acceptor: TlsAcceptor) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let tls_acceptor = tls_acceptor.clone();
                let gateway = gateway.clone();
                tokio::task::spawn(async move {
                    match tls_acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = serve(tls_stream, gateway, InboundScheme::Https).await {
                                debug!("Error serving HTTPS connection from {}: {}", peer_addr, e);
                            }
                        }
                        Err(e) => debug!("TLS error from {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => warn!("Error accepting HTTPS connection: {}", e),
        }
    }
}

async fn serve<S>(stream: S, gateway: Arc<Gateway>, scheme: InboundScheme) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut request: Request<Incoming>| {
        let gateway = gateway.clone();
        request.extensions_mut().insert(scheme);
        async move { Ok::<_, Infallible>(gateway.handle(request).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::StaticIdentityResolver;
    use aggregator_proxy::RequestForwarder;
    use http_body_util::Empty;

    fn gateway() -> Gateway {
        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        let registry = ApiServiceRegistry::new(
            Arc::new(StaticIdentityResolver::anonymous()),
            Arc::new(RequestForwarder::default()),
        )
        .with_metrics(metrics.clone());
        Gateway::new(Arc::new(registry), metrics)
    }

    async fn get(gateway: &Gateway, path: &str) -> (StatusCode, String) {
        let request = Request::get(path).body(Empty::<Bytes>::new()).unwrap();
        let response = gateway.handle(request).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(get(&gateway(), "/healthz").await, (StatusCode::OK, "OK\n".to_string()));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let gateway = gateway();
        gateway.metrics.record("v1.foo", "no_route", std::time::Duration::from_millis(1));

        let (status, body) = get(&gateway, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("aggregator_proxy_requests_total"));
    }

    #[tokio::test]
    async fn test_unregistered_path_is_not_found() {
        let (status, body) = get(&gateway(), "/apis/foo/v1/bars").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }
}
