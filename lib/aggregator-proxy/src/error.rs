//! Proxy failure taxonomy and its mapping to caller-visible responses

use crate::forwarder::ProxyBody;
use aggregator_core::CoreError;
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, Response, StatusCode};
use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No backend registered for {api_service}")]
    NoRoute { api_service: String },

    /// The authentication stage upstream of the gateway attached no identity
    #[error("missing user")]
    MissingIdentity,

    #[error("Backend {destination} unreachable: {source}")]
    BackendUnreachable {
        destination: String,
        #[source]
        source: BoxError,
    },

    /// The backend's certificate chain failed the route's trust policy
    #[error("Backend {destination} presented an untrusted certificate: {reason}")]
    TrustRejected {
        destination: String,
        #[source]
        reason: rustls::Error,
    },

    #[error("Invalid forwarded header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Invalid route configuration: {0}")]
    Config(#[from] CoreError),

    #[error("TLS client configuration error: {0}")]
    Tls(String),
}

/// Failure kinds, kept distinct for logs and metrics even where the status is shared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    NoRoute,
    MissingIdentity,
    BackendUnreachable,
    TrustRejected,
    InvalidHeader,
    Configuration,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoRoute => "no_route",
            FailureKind::MissingIdentity => "missing_identity",
            FailureKind::BackendUnreachable => "backend_unreachable",
            FailureKind::TrustRejected => "trust_rejected",
            FailureKind::InvalidHeader => "invalid_header",
            FailureKind::Configuration => "configuration",
        }
    }
}

impl ProxyError {
    pub(crate) fn unreachable(destination: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ProxyError::BackendUnreachable {
            destination: destination.into(),
            source: source.into(),
        }
    }

    /// Classify a failed backend call: a certificate rejection anywhere in the
    /// error's source chain becomes `TrustRejected`
    pub(crate) fn from_backend_error(destination: impl Into<String>, err: impl Into<BoxError>) -> Self {
        let err = err.into();
        let mut rejection = None;
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&*err);
        while let Some(current) = cause {
            if let Some(reason) = current
                .downcast_ref::<io::Error>()
                .and_then(|io_err| crate::trust::certificate_rejection(io_err))
            {
                rejection = Some(reason.clone());
                break;
            }
            cause = current.source();
        }

        match rejection {
            Some(reason) => ProxyError::TrustRejected {
                destination: destination.into(),
                reason,
            },
            None => Self::unreachable(destination, err),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ProxyError::NoRoute { .. } => FailureKind::NoRoute,
            ProxyError::MissingIdentity => FailureKind::MissingIdentity,
            ProxyError::BackendUnreachable { .. } => FailureKind::BackendUnreachable,
            ProxyError::TrustRejected { .. } => FailureKind::TrustRejected,
            ProxyError::InvalidHeader { .. } => FailureKind::InvalidHeader,
            ProxyError::Config(_) | ProxyError::Tls(_) => FailureKind::Configuration,
        }
    }

    /// True for every failure to reach the backend, trust rejections included
    pub fn is_backend_unreachable(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendUnreachable { .. } | ProxyError::TrustRejected { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute { .. } => StatusCode::NOT_FOUND,
            ProxyError::BackendUnreachable { .. } | ProxyError::TrustRejected { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::MissingIdentity
            | ProxyError::InvalidHeader { .. }
            | ProxyError::Config(_)
            | ProxyError::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-visible response. Not-found and backend failures carry an empty body.
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status_code();
        let body = match self.kind() {
            FailureKind::NoRoute | FailureKind::BackendUnreachable | FailureKind::TrustRejected => {
                Bytes::new()
            }
            _ => Bytes::from(format!("{}\n", self)),
        };
        let mut response = Response::new(full(body));
        *response.status_mut() = status;
        response
    }
}

pub(crate) fn full(body: Bytes) -> ProxyBody {
    Full::new(body).map_err(|never| match never {}).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_identity_response() {
        let response = ProxyError::MissingIdentity.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_of(response).await.contains("missing user"));
    }

    #[tokio::test]
    async fn test_no_route_response_is_empty() {
        let response = ProxyError::NoRoute {
            api_service: "v1.foo".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await, "");
    }

    #[tokio::test]
    async fn test_backend_failures_share_status_but_not_kind() {
        let unreachable = ProxyError::unreachable(
            "10.0.0.1:443",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let rejected = ProxyError::TrustRejected {
            destination: "10.0.0.1:443".to_string(),
            reason: rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        };

        assert!(unreachable.is_backend_unreachable());
        assert!(rejected.is_backend_unreachable());
        assert_eq!(unreachable.kind(), FailureKind::BackendUnreachable);
        assert_eq!(rejected.kind(), FailureKind::TrustRejected);

        let response = rejected.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_of(response).await, "");
    }

    #[derive(Debug, Error)]
    #[error("connect failed")]
    struct Wrapped(#[source] io::Error);

    #[test]
    fn test_backend_error_classification() {
        let rejected = ProxyError::from_backend_error(
            "backend:443",
            io::Error::new(
                io::ErrorKind::InvalidData,
                rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
            ),
        );
        assert_eq!(rejected.kind(), FailureKind::TrustRejected);

        let nested = ProxyError::from_backend_error(
            "backend:443",
            Wrapped(io::Error::new(
                io::ErrorKind::InvalidData,
                rustls::Error::InvalidCertificate(rustls::CertificateError::Expired),
            )),
        );
        assert_eq!(nested.kind(), FailureKind::TrustRejected);

        let reset = ProxyError::from_backend_error(
            "backend:443",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert_eq!(reset.kind(), FailureKind::BackendUnreachable);
    }
}
