//! Request routing core of the aggregation gateway
//!
//! A [`ProxyHandler`] owns the route for one registered API group/version and
//! forwards each request to that backend over TLS, propagating the caller's
//! identity in `X-Remote-*` headers.
//!
//! The backend can only trust those headers if the channel between the gateway
//! and the backend is itself authenticated (mutual TLS or a private network).
//! Nothing in this crate lets a backend prove a request came from the gateway;
//! that is a deployment requirement.

pub mod connector;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod headers;
pub mod metrics;
pub mod tls;
pub mod trust;

pub use error::{FailureKind, ProxyError};
pub use forwarder::{BackendClient, ForwarderConfig, ProxyBody, RequestForwarder};
pub use handler::{BackendRoute, ProxyHandler};
pub use headers::{ForwardedContext, InboundScheme};
pub use metrics::ProxyMetrics;
pub use tls::ServingCertificate;
pub use trust::TrustEvaluator;
