//! TLS termination for intercepted CONNECT tunnels.
//!
//! Provides certificate caching and a dynamic resolver so the proxy can
//! present a freshly-minted leaf for whatever hostname the client asks for
//! (SNI preferred, CONNECT authority as fallback).
//!
//! # Critical ALPN note
//!
//! The acceptor forces HTTP/1.1 via ALPN. If HTTP/2 were negotiated, the
//! in-tunnel parser (hyper http1) would face H2 framing it cannot read and
//! every intercepted request would fail.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

use super::ca::ProxyCa;
use super::error::ProxyError;

/// Cache of minted leaf certificates, keyed by lowercased hostname.
///
/// Minting involves a keypair generation and a signature; caching keeps
/// repeat connections to the same host cheap for the process lifetime.
pub struct CertificateCache {
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    ca: Arc<ProxyCa>,
}

impl CertificateCache {
    /// Create an empty cache backed by the given CA.
    pub fn new(ca: Arc<ProxyCa>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Get the cached leaf for `hostname`, minting one on first use.
    pub fn get_or_mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let key = hostname.to_lowercase();

        {
            let cache = self.cache.read().expect("cert cache poisoned");
            if let Some(entry) = cache.get(&key) {
                trace!(hostname, "leaf certificate cache hit");
                return Ok(entry.clone());
            }
        }

        debug!(hostname, "minting leaf certificate");
        let leaf = self.ca.mint_leaf(hostname)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("failed to parse leaf PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("no certificates in minted PEM".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("failed to parse leaf key PEM: {e}")))?
                .ok_or_else(|| ProxyError::Tls("no private key in minted PEM".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| ProxyError::Tls(format!("failed to build signing key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(cert_chain, signing_key));
        self.cache
            .write()
            .expect("cert cache poisoned")
            .insert(key, certified.clone());

        Ok(certified)
    }

    /// Number of cached leaves.
    pub fn len(&self) -> usize {
        self.cache.read().expect("cert cache poisoned").len()
    }

    /// True when nothing has been minted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolver minting certificates on demand from SNI, with the CONNECT
/// authority as a hint for SNI-less clients.
struct DynamicCertResolver {
    cache: Arc<CertificateCache>,
    hostname_hint: String,
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.hostname_hint.clone());

        match self.cache.get_or_mint(&hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(hostname, error = %e, "leaf certificate resolution failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("hostname_hint", &self.hostname_hint)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Build a TLS acceptor presenting minted leaves, ALPN pinned to HTTP/1.1.
pub fn create_tls_acceptor(
    cert_cache: Arc<CertificateCache>,
    hostname_hint: String,
) -> TlsAcceptor {
    // The dependency graph compiles in more than one rustls provider
    // (reqwest's TLS stack brings its own); the first acceptor pins the
    // process default so builder() stays unambiguous.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let resolver: Arc<dyn ResolvesServerCert> = Arc::new(DynamicCertResolver {
        cache: cert_cache,
        hostname_hint,
    });

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}
