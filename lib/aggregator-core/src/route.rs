//! Route configuration for a registered backend and the store that swaps it atomically

use crate::{CoreError, Result};
use http::uri::Authority;
use rustls::pki_types::CertificateDer;
use rustls_pemfile::certs;
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Port used when a destination address does not carry one
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Network address of a backend (`host:port`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` address. IPv6 literals must be bracketed (`[::1]:8443`).
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(CoreError::InvalidDestination("empty address".to_string()));
        }

        let authority: Authority = address
            .parse()
            .map_err(|e| CoreError::InvalidDestination(format!("{}: {}", address, e)))?;
        if authority.as_str().contains('@') {
            return Err(CoreError::InvalidDestination(format!(
                "{}: user info is not allowed",
                address
            )));
        }

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.is_empty() {
            return Err(CoreError::InvalidDestination(format!("{}: missing host", address)));
        }

        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_HTTPS_PORT),
        })
    }

    /// Host name or IP literal, without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Rule deciding whether a backend's serving certificate is accepted
#[derive(Clone, Debug, PartialEq)]
pub enum TrustPolicy {
    /// Accept any certificate chain. The registrant opted out of verification.
    SkipVerification,
    /// Accept only chains that verify against these trust anchors
    TrustBundle(Vec<CertificateDer<'static>>),
}

impl TrustPolicy {
    /// Build a trust bundle policy from PEM-encoded CA certificates
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        Self::trust_bundle(load_certificates(pem_data)?)
    }

    /// Build a trust bundle policy; an empty bundle could never accept anything
    pub fn trust_bundle(certs: Vec<CertificateDer<'static>>) -> Result<Self> {
        if certs.is_empty() {
            return Err(CoreError::EmptyTrustBundle);
        }
        Ok(TrustPolicy::TrustBundle(certs))
    }

    pub fn is_skip_verification(&self) -> bool {
        matches!(self, TrustPolicy::SkipVerification)
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TrustPolicy::SkipVerification => "skip-verification",
            TrustPolicy::TrustBundle(_) => "trust-bundle",
        }
    }
}

/// Load certificates from PEM-encoded data
pub fn load_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem_data);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CoreError::InvalidTrustBundle(e.to_string()))
}

/// The backend currently bound to one API group/version
#[derive(Clone, Debug, PartialEq)]
pub struct RouteConfig {
    destination: Destination,
    trust_policy: TrustPolicy,
}

impl RouteConfig {
    pub fn new(destination: Destination, trust_policy: TrustPolicy) -> Self {
        Self {
            destination,
            trust_policy,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn trust_policy(&self) -> &TrustPolicy {
        &self.trust_policy
    }
}

/// Holds at most one live route as an immutable value.
///
/// `update` and `remove` replace the whole value under the write lock, so a
/// `snapshot` observes either the previous route or the new one in full. A
/// snapshot is an `Arc` and stays valid after later swaps.
pub struct RouteStore<T> {
    current: RwLock<Option<Arc<T>>>,
}

impl<T> RouteStore<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Install a new route, replacing any previous one
    pub async fn update(&self, route: T) {
        let route = Arc::new(route);
        let previous = {
            let mut current = self.current.write().await;
            current.replace(route)
        };
        debug!(replaced = previous.is_some(), "Route installed");
    }

    /// Clear the route. Returns whether one was registered.
    pub async fn remove(&self) -> bool {
        let previous = self.current.write().await.take();
        debug!(removed = previous.is_some(), "Route removed");
        previous.is_some()
    }

    /// The route as of now; unaffected by later `update`/`remove` calls
    pub async fn snapshot(&self) -> Option<Arc<T>> {
        self.current.read().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.current.read().await.is_some()
    }
}

impl<T> Default for RouteStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/ca.pem"));

    fn route(address: &str, trust_policy: TrustPolicy) -> RouteConfig {
        RouteConfig::new(Destination::parse(address).unwrap(), trust_policy)
    }

    #[test]
    fn test_destination_parse_host_port() {
        let dest = Destination::parse("api.example.svc:8443").unwrap();
        assert_eq!(dest.host(), "api.example.svc");
        assert_eq!(dest.port(), 8443);
        assert_eq!(dest.to_string(), "api.example.svc:8443");
    }

    #[test]
    fn test_destination_default_port() {
        let dest = Destination::parse("api.example.svc").unwrap();
        assert_eq!(dest.port(), DEFAULT_HTTPS_PORT);
    }

    #[test]
    fn test_destination_ipv6() {
        let dest = Destination::parse("[::1]:9443").unwrap();
        assert_eq!(dest.host(), "::1");
        assert_eq!(dest.port(), 9443);
        assert_eq!(dest.to_string(), "[::1]:9443");
    }

    #[test]
    fn test_destination_invalid() {
        assert!(Destination::parse("").is_err());
        assert!(Destination::parse("   ").is_err());
        assert!(Destination::parse("user@host:443").is_err());
        assert!(Destination::parse(":8443").is_err());
    }

    #[test]
    fn test_trust_policy_from_pem() {
        let policy = TrustPolicy::from_pem(CA_PEM).unwrap();
        match &policy {
            TrustPolicy::TrustBundle(certs) => assert_eq!(certs.len(), 1),
            TrustPolicy::SkipVerification => panic!("expected a trust bundle"),
        }
        assert!(!policy.is_skip_verification());
        assert_eq!(policy.kind(), "trust-bundle");
    }

    #[test]
    fn test_trust_policy_empty_bundle() {
        assert!(matches!(
            TrustPolicy::from_pem(b"not a certificate"),
            Err(CoreError::EmptyTrustBundle)
        ));
        assert!(matches!(
            TrustPolicy::trust_bundle(Vec::new()),
            Err(CoreError::EmptyTrustBundle)
        ));
    }

    #[tokio::test]
    async fn test_remove_without_route_is_noop() {
        let store: RouteStore<RouteConfig> = RouteStore::new();
        assert!(!store.remove().await);
        assert!(!store.remove().await);
        assert!(store.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_update_then_remove() {
        let store = RouteStore::new();
        store.update(route("a.svc:443", TrustPolicy::SkipVerification)).await;
        assert!(store.is_registered().await);

        assert!(store.remove().await);
        assert!(!store.is_registered().await);
        assert!(store.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_second_update_wins() {
        let store = RouteStore::new();
        let bundle = TrustPolicy::from_pem(CA_PEM).unwrap();
        store.update(route("a.svc:443", TrustPolicy::SkipVerification)).await;
        store.update(route("b.svc:8443", bundle.clone())).await;

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.destination().to_string(), "b.svc:8443");
        assert_eq!(snapshot.trust_policy(), &bundle);
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_update() {
        let store = RouteStore::new();
        store.update(route("a.svc:443", TrustPolicy::SkipVerification)).await;
        let before = store.snapshot().await.unwrap();

        store.update(route("b.svc:443", TrustPolicy::SkipVerification)).await;
        store.remove().await;

        assert_eq!(before.destination().host(), "a.svc");
        assert!(store.snapshot().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_snapshots_never_torn() {
        let store = Arc::new(RouteStore::new());
        let bundle = TrustPolicy::from_pem(CA_PEM).unwrap();
        store.update(route("a.svc:443", TrustPolicy::SkipVerification)).await;

        let writer = {
            let store = store.clone();
            let bundle = bundle.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    if i % 2 == 0 {
                        store.update(route("b.svc:8443", bundle.clone())).await;
                    } else {
                        store.update(route("a.svc:443", TrustPolicy::SkipVerification)).await;
                    }
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = store.snapshot().await.unwrap();
                    match snapshot.destination().host() {
                        "a.svc" => assert!(snapshot.trust_policy().is_skip_verification()),
                        "b.svc" => assert!(!snapshot.trust_policy().is_skip_verification()),
                        other => panic!("unexpected host {}", other),
                    }
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
