//! Backend certificate trust decisions
//!
//! A [`TrustEvaluator`] is the rustls certificate verifier for one route. It
//! consumes the route's [`TrustPolicy`] in a single `verify_server_cert`
//! decision and holds no mutable state, so one instance serves every
//! handshake made for that route.

use crate::ProxyError;
use aggregator_core::TrustPolicy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
enum Verification {
    Skip,
    Bundle(Arc<WebPkiServerVerifier>),
}

#[derive(Debug)]
pub struct TrustEvaluator {
    verification: Verification,
    provider: Arc<CryptoProvider>,
}

impl TrustEvaluator {
    pub fn new(policy: &TrustPolicy) -> Result<Self, ProxyError> {
        let provider = Arc::new(crypto::ring::default_provider());

        let verification = match policy {
            TrustPolicy::SkipVerification => Verification::Skip,
            TrustPolicy::TrustBundle(certs) => {
                let mut roots = RootCertStore::empty();
                for cert in certs {
                    roots
                        .add(cert.clone())
                        .map_err(|e| ProxyError::Tls(format!("Failed to add trust anchor: {}", e)))?;
                }
                debug!("Trust evaluator loaded {} trust anchor(s)", roots.len());

                let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| ProxyError::Tls(format!("Failed to build certificate verifier: {}", e)))?;
                Verification::Bundle(verifier)
            }
        };

        Ok(Self {
            verification,
            provider,
        })
    }

    /// Client TLS configuration whose certificate decisions are made by this evaluator
    pub fn client_config(self) -> Result<ClientConfig, ProxyError> {
        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(self))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    pub fn skips_verification(&self) -> bool {
        matches!(self.verification, Verification::Skip)
    }
}

impl ServerCertVerifier for TrustEvaluator {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.verification {
            Verification::Skip => {
                debug!(server_name = ?server_name, "Accepting backend certificate without verification");
                Ok(ServerCertVerified::assertion())
            }
            Verification::Bundle(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .inspect_err(|e| {
                    warn!(server_name = ?server_name, error = %e, "Backend certificate rejected by trust bundle");
                }),
        }
    }

    // Handshake signatures are verified under both policies.
    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The certificate error behind a failed handshake, if the failure was a trust rejection
pub fn certificate_rejection(err: &io::Error) -> Option<&rustls::Error> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .filter(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_core::route::load_certificates;

    const CA_PEM: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/ca.pem"));
    const UNTRUSTED_CA_PEM: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/untrusted-ca.pem"));
    const BACKEND_PEM: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../testdata/backend.pem"));

    fn backend_cert() -> CertificateDer<'static> {
        load_certificates(BACKEND_PEM).unwrap().remove(0)
    }

    fn evaluate(policy: &TrustPolicy, server_name: &str) -> Result<ServerCertVerified, rustls::Error> {
        let evaluator = TrustEvaluator::new(policy).unwrap();
        let server_name = ServerName::try_from(server_name).unwrap();
        evaluator.verify_server_cert(&backend_cert(), &[], &server_name, &[], UnixTime::now())
    }

    #[test]
    fn test_bundle_accepts_chain_from_its_ca() {
        let policy = TrustPolicy::from_pem(CA_PEM).unwrap();
        assert!(evaluate(&policy, "127.0.0.1").is_ok());
        assert!(evaluate(&policy, "localhost").is_ok());
    }

    #[test]
    fn test_bundle_rejects_unknown_issuer() {
        let policy = TrustPolicy::from_pem(UNTRUSTED_CA_PEM).unwrap();
        let err = evaluate(&policy, "127.0.0.1").unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
        );
    }

    #[test]
    fn test_bundle_rejects_wrong_name() {
        let policy = TrustPolicy::from_pem(CA_PEM).unwrap();
        let err = evaluate(&policy, "other.example.com").unwrap_err();
        assert!(matches!(err, rustls::Error::InvalidCertificate(_)));
    }

    #[test]
    fn test_skip_accepts_any_chain() {
        let evaluator = TrustEvaluator::new(&TrustPolicy::SkipVerification).unwrap();
        assert!(evaluator.skips_verification());

        let garbage = CertificateDer::from(vec![1, 2, 3]);
        let server_name = ServerName::try_from("backend.example.com").unwrap();
        assert!(evaluator
            .verify_server_cert(&garbage, &[], &server_name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn test_client_config_builds_for_both_policies() {
        let bundle = TrustPolicy::from_pem(CA_PEM).unwrap();
        for policy in [TrustPolicy::SkipVerification, bundle] {
            let config = TrustEvaluator::new(&policy).unwrap().client_config().unwrap();
            assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn test_certificate_rejection_only_matches_certificate_errors() {
        let rejected = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::Expired),
        );
        assert!(certificate_rejection(&rejected).is_some());

        let protocol = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::HandshakeNotComplete);
        assert!(certificate_rejection(&protocol).is_none());

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(certificate_rejection(&refused).is_none());
    }
}
