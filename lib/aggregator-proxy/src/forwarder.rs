//! HTTPS request forwarding to a registered backend
//!
//! Every route owns a pooled HTTP/1.1 client, so idle TCP + TLS connections to
//! its destination are reused until the route is replaced or removed. Requests
//! are never retried. The request body is streamed up and the backend's
//! response body is streamed back without buffering.

use crate::connector::BackendConnector;
use crate::error::BoxError;
use crate::headers::{strip_hop_by_hop, ForwardedContext};
use crate::trust::TrustEvaluator;
use crate::ProxyError;
use aggregator_core::{Destination, RouteConfig};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Body type of every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

/// Connection deadlines and pooling for backend calls
#[derive(Clone, Debug, PartialEq)]
pub struct ForwarderConfig {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// How long an idle backend connection stays in the pool
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_route: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_route: 32,
        }
    }
}

/// Pooled TLS client bound to one route's destination and trust policy
pub struct BackendClient {
    destination: Destination,
    http: Client<BackendConnector, OutboundBody>,
}

impl BackendClient {
    pub fn new(route: &RouteConfig, config: &ForwarderConfig) -> Result<Self, ProxyError> {
        let destination = route.destination().clone();
        let server_name = ServerName::try_from(destination.host().to_string()).map_err(|e| {
            ProxyError::Tls(format!("Invalid server name {}: {}", destination.host(), e))
        })?;

        let tls = TrustEvaluator::new(route.trust_policy())?.client_config()?;
        let connector = BackendConnector::new(
            destination.clone(),
            server_name,
            TlsConnector::from(Arc::new(tls)),
            config,
        );

        let http = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_route)
            .pool_timer(TokioTimer::new())
            .retry_canceled_requests(false)
            .build::<_, OutboundBody>(connector);

        Ok(Self { destination, http })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

/// Forwards requests to backends without retrying
pub struct RequestForwarder {
    config: ForwarderConfig,
}

impl RequestForwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Forward `request` to the client's destination and relay the response.
    ///
    /// Path and query are preserved, hop-by-hop headers dropped, and the
    /// forwarding headers from `context` applied. Any failure before the
    /// backend's response head arrives is reported as an error; after that the
    /// body is passed through as-is.
    pub async fn forward<B>(
        &self,
        client: &BackendClient,
        request: Request<B>,
        context: &ForwardedContext,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let destination = client.destination.to_string();
        let (mut parts, body) = request.into_parts();

        strip_hop_by_hop(&mut parts.headers);
        context.apply(&mut parts.headers)?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        // The pool needs an absolute URI; the origin-form target goes on the wire
        parts.uri = format!("https://{}{}", destination, path_and_query)
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidHeader {
                name: "request-target".to_string(),
                reason: e.to_string(),
            })?;
        parts.version = Version::HTTP_11;
        parts.headers.insert(
            HOST,
            HeaderValue::from_str(&destination).map_err(|e| ProxyError::InvalidHeader {
                name: HOST.to_string(),
                reason: e.to_string(),
            })?,
        );

        debug!(
            destination = %destination,
            method = %parts.method,
            uri = %parts.uri,
            headers = parts.headers.len(),
            "Forwarding request to backend"
        );

        let outbound: Request<OutboundBody> =
            Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());

        let response = client
            .http
            .request(outbound)
            .await
            .map_err(|e| ProxyError::from_backend_error(destination.clone(), e))?;

        debug!(destination = %destination, status = %response.status(), "Backend responded");
        Ok(response.map(|body| body.boxed_unsync()))
    }
}

impl Default for RequestForwarder {
    fn default() -> Self {
        Self::new(ForwarderConfig::default())
    }
}
