//! Proxy handler for one registered API group/version
//!
//! The handler owns the backend route under a [`RouteStore`] and runs every
//! inbound request through the same steps: take a route snapshot, resolve the
//! caller's identity, forward to the backend. Failures map to statuses:
//!
//! - no route registered: 404, empty body
//! - no identity attached by authentication: 500, `missing user`
//! - backend connect/TLS failure (trust rejection included): 503, empty body
//!
//! The snapshot is taken once per request, so a route swap never changes the
//! destination of a request already being dispatched.

use crate::error::BoxError;
use crate::forwarder::{BackendClient, ForwarderConfig, ProxyBody, RequestForwarder};
use crate::headers::ForwardedContext;
use crate::metrics::{ProxyMetrics, OUTCOME_PROXIED};
use crate::{FailureKind, ProxyError};
use aggregator_core::{Destination, IdentityResolver, RouteConfig, RouteStore, TrustPolicy};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Installed route: its configuration and the pooled TLS client built from it.
/// Replacing the route drops the client along with its idle connections.
pub struct BackendRoute {
    config: RouteConfig,
    client: BackendClient,
}

impl BackendRoute {
    pub fn new(config: RouteConfig, forwarder: &ForwarderConfig) -> Result<Self, ProxyError> {
        let client = BackendClient::new(&config, forwarder)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn client(&self) -> &BackendClient {
        &self.client
    }
}

pub struct ProxyHandler {
    name: String,
    resolver: Arc<dyn IdentityResolver>,
    forwarder: Arc<RequestForwarder>,
    routes: RouteStore<BackendRoute>,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ProxyHandler {
    /// Create a handler with no route installed; it answers 404 until `update`
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn IdentityResolver>,
        forwarder: Arc<RequestForwarder>,
    ) -> Self {
        Self {
            name: name.into(),
            resolver,
            forwarder,
            routes: RouteStore::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// API service name this handler serves (e.g. `v1.foo`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install a new backend route.
    ///
    /// The destination and trust policy are validated and the TLS client built
    /// before the swap; on error the previously installed route is untouched.
    pub async fn update(&self, destination: &str, trust_policy: TrustPolicy) -> Result<(), ProxyError> {
        let destination = Destination::parse(destination)?;
        let route = BackendRoute::new(RouteConfig::new(destination, trust_policy), self.forwarder.config())?;

        if route.config.trust_policy().is_skip_verification() {
            warn!(
                api_service = %self.name,
                destination = %route.config.destination(),
                "Backend TLS verification disabled for this route"
            );
        }
        info!(
            api_service = %self.name,
            destination = %route.config.destination(),
            trust_policy = route.config.trust_policy().kind(),
            "Updating backend route"
        );

        self.routes.update(route).await;
        Ok(())
    }

    /// Clear the backend route. Requests dispatched afterwards get 404.
    pub async fn remove(&self) {
        if self.routes.remove().await {
            info!(api_service = %self.name, "Removed backend route");
        } else {
            debug!(api_service = %self.name, "No backend route to remove");
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<BackendRoute>> {
        self.routes.snapshot().await
    }

    pub async fn is_registered(&self) -> bool {
        self.routes.is_registered().await
    }

    /// Serve one request against the route installed right now
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let route = self.routes.snapshot().await;
        self.handle_with_route(route, request).await
    }

    /// Serve one request against a route snapshot taken earlier
    pub async fn handle_with_route<B>(&self, route: Option<Arc<BackendRoute>>, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let (response, outcome) = match self.dispatch(route, request).await {
            Ok(response) => (response, OUTCOME_PROXIED),
            Err(e) => {
                self.log_failure(&method, &path, &e);
                let outcome = e.kind().as_str();
                (e.into_response(), outcome)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record(&self.name, outcome, started.elapsed());
        }
        response
    }

    async fn dispatch<B>(&self, route: Option<Arc<BackendRoute>>, request: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let route = route.ok_or_else(|| ProxyError::NoRoute {
            api_service: self.name.clone(),
        })?;

        let (parts, body) = request.into_parts();
        let resolution = self.resolver.resolve(&parts).await;
        let user = resolution.user.ok_or(ProxyError::MissingIdentity)?;

        if let Some(info) = &resolution.request_info {
            debug!(
                api_service = %self.name,
                user = %user.name,
                verb = %info.verb,
                resource = %info.resource,
                "Dispatching request"
            );
        }

        let context = ForwardedContext::from_request(&parts, user);
        self.forwarder
            .forward(route.client(), Request::from_parts(parts, body), &context)
            .await
    }

    fn log_failure(&self, method: &hyper::Method, path: &str, err: &ProxyError) {
        match err.kind() {
            FailureKind::NoRoute => {
                debug!(api_service = %self.name, %method, path, "No backend route registered");
            }
            FailureKind::MissingIdentity => {
                error!(
                    api_service = %self.name,
                    %method,
                    path,
                    "Request reached the proxy without an authenticated user; check the authentication stage"
                );
            }
            FailureKind::BackendUnreachable | FailureKind::TrustRejected => {
                warn!(
                    api_service = %self.name,
                    %method,
                    path,
                    kind = err.kind().as_str(),
                    error = %err,
                    "Backend unavailable"
                );
            }
            FailureKind::InvalidHeader | FailureKind::Configuration => {
                error!(api_service = %self.name, %method, path, error = %err, "Failed to proxy request");
            }
        }
    }
}
