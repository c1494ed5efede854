//! TLS serving configuration for the gateway's HTTPS listener

use aggregator_core::route::load_certificates;
use anyhow::{anyhow, Result};
use rustls::crypto;
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use rustls_pemfile::{read_all, Item};
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info};

/// Serving certificate chain and key
pub struct ServingCertificate {
    /// PEM-encoded certificate chain
    pub cert: Vec<u8>,
    /// PEM-encoded private key
    pub key: Vec<u8>,
}

impl ServingCertificate {
    pub fn new(cert: Vec<u8>, key: Vec<u8>) -> Self {
        Self { cert, key }
    }

    /// Read the certificate chain and key from PEM files
    pub fn from_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert = std::fs::read(cert_path)
            .map_err(|e| anyhow!("Failed to read TLS certificate from {}: {}", cert_path, e))?;
        let key = std::fs::read(key_path)
            .map_err(|e| anyhow!("Failed to read TLS key from {}: {}", key_path, e))?;
        Ok(Self::new(cert, key))
    }

    /// Build a rustls server configuration that serves HTTP/1.1
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        debug!("Creating TLS configuration from PEM data");

        let certs = load_certificates(&self.cert)?;
        if certs.is_empty() {
            return Err(anyhow!("No certificates found in PEM data"));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let private_key = parse_private_key(&self.key)?;

        let mut config = ServerConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!("TLS serving configuration created");
        Ok(Arc::new(config))
    }
}

fn parse_private_key(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut key_reader = BufReader::new(key_pem);
    let items: Vec<Item> = read_all(&mut key_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow!("Failed to parse private key: {}", e))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::Pkcs8Key(k) => Some(PrivateKeyDer::Pkcs8(k)),
            Item::Sec1Key(k) => Some(PrivateKeyDer::Sec1(k)),
            Item::Pkcs1Key(k) => Some(PrivateKeyDer::Pkcs1(k)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("No private key found in PEM data"))
}
