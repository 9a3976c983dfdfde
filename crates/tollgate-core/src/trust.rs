//! TLS trust evaluation for identity-provider endpoints.
//!
//! A [`TrustStore`] is the set of roots a provider's certificate chain must
//! lead to. The same store feeds both the explicit [`TrustEvaluator::evaluate`]
//! probe and the rustls config handed to the transport, so a chain that fails
//! one fails the other.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::error::{Error, Result};

/// Where a provider's trusted roots come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum TrustStoreRef {
    /// The bundled Mozilla root program.
    #[default]
    System,
    /// A PEM bundle of one or more CA certificates.
    PemFile(PathBuf),
}

impl From<String> for TrustStoreRef {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("system") {
            Self::System
        } else {
            Self::PemFile(PathBuf::from(value))
        }
    }
}

impl fmt::Display for TrustStoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::PemFile(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Result of checking a provider's TLS identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Trusted,
    /// The chain did not validate: unknown issuer, expired, wrong host name.
    UntrustedChain(String),
    /// The TLS exchange failed for a reason other than the chain itself.
    HandshakeFailure(String),
    /// No TLS exchange happened: the host was unreachable or refused.
    ConnectFailure(String),
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Trusted => None,
            Self::UntrustedChain(r) | Self::HandshakeFailure(r) | Self::ConnectFailure(r) => {
                Some(r)
            }
        }
    }
}

/// Loaded root certificates for one trust-store reference.
#[derive(Clone)]
pub struct TrustStore {
    reference: TrustStoreRef,
    roots: Arc<RootCertStore>,
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("reference", &self.reference)
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl TrustStore {
    pub fn load(reference: &TrustStoreRef) -> Result<Self> {
        match reference {
            TrustStoreRef::System => Ok(Self::system()),
            TrustStoreRef::PemFile(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::Trust(format!("cannot read trust store {}: {e}", path.display()))
                })?;
                Self::from_pem(reference.clone(), &pem)
            }
        }
    }

    pub fn system() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(TLS_SERVER_ROOTS.iter().cloned());
        Self {
            reference: TrustStoreRef::System,
            roots: Arc::new(roots),
        }
    }

    /// Build a store from PEM text. An empty bundle is an error: a store that
    /// trusts nothing is always a misconfiguration.
    pub fn from_pem(reference: TrustStoreRef, pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(pem) {
            let cert = cert
                .map_err(|e| Error::Trust(format!("invalid PEM in trust store {reference}: {e}")))?;
            roots.add(cert).map_err(|e| {
                Error::Trust(format!("unusable certificate in trust store {reference}: {e}"))
            })?;
        }
        if roots.is_empty() {
            return Err(Error::Trust(format!(
                "trust store {reference} contains no certificates"
            )));
        }
        Ok(Self {
            reference,
            roots: Arc::new(roots),
        })
    }

    pub fn reference(&self) -> &TrustStoreRef {
        &self.reference
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Performs TLS handshakes against provider hosts and classifies failures.
#[derive(Debug, Clone)]
pub struct TrustEvaluator {
    connect_timeout: Duration,
}

impl TrustEvaluator {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// The rustls client configuration every outbound provider call uses.
    pub fn client_config(store: &TrustStore) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Trust(format!("TLS config: {e}")))?
            .with_root_certificates(store.roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Handshake with `host:port` and report whether its chain is trusted by
    /// `store`. No application data is sent.
    pub async fn evaluate(&self, host: &str, port: u16, store: &TrustStore) -> TrustDecision {
        let config = match Self::client_config(store) {
            Ok(c) => c,
            Err(e) => return TrustDecision::HandshakeFailure(e.to_string()),
        };
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(e) => return TrustDecision::HandshakeFailure(format!("invalid host name: {e}")),
        };

        let tcp = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return TrustDecision::ConnectFailure(e.to_string()),
            Err(_) => {
                return TrustDecision::ConnectFailure(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ));
            }
        };

        let connector = TlsConnector::from(Arc::new(config));
        let decision = match tokio::time::timeout(
            self.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        {
            Ok(Ok(_stream)) => TrustDecision::Trusted,
            Ok(Err(e)) => classify_error(&e)
                .unwrap_or_else(|| TrustDecision::HandshakeFailure(e.to_string())),
            Err(_) => TrustDecision::HandshakeFailure("handshake timed out".to_string()),
        };

        tracing::debug!(host, port, trust_store = %store.reference(), ?decision, "trust evaluated");
        decision
    }
}

impl Default for TrustEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Find a rustls error anywhere in `err`'s source chain.
///
/// `io::Error::source()` skips its own payload, so an io::Error link steps
/// into `get_ref()` instead. Nested io::Errors are walked the same way.
pub fn classify_error(err: &(dyn StdError + 'static)) -> Option<TrustDecision> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(classify_tls(tls));
        }
        current = match e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => e.source(),
        };
    }
    None
}

fn classify_tls(err: &rustls::Error) -> TrustDecision {
    match err {
        rustls::Error::InvalidCertificate(_) => TrustDecision::UntrustedChain(err.to_string()),
        _ => TrustDecision::HandshakeFailure(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn self_signed(names: &[&str]) -> rcgen::CertifiedKey {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        rcgen::generate_simple_self_signed(names).unwrap()
    }

    /// TLS listener that completes handshakes and then hangs up.
    async fn spawn_tls_server(cert: &rcgen::CertifiedKey) -> u16 {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else { break };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _ = acceptor.accept(tcp).await;
                });
            }
        });
        port
    }

    fn store_for(cert: &rcgen::CertifiedKey) -> TrustStore {
        TrustStore::from_pem(
            TrustStoreRef::PemFile(PathBuf::from("test.pem")),
            cert.cert.pem().as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn trust_store_ref_from_string() {
        assert_eq!(TrustStoreRef::from("system".to_string()), TrustStoreRef::System);
        assert_eq!(TrustStoreRef::from("SYSTEM".to_string()), TrustStoreRef::System);
        assert_eq!(
            TrustStoreRef::from("/etc/tollgate/idp.pem".to_string()),
            TrustStoreRef::PemFile(PathBuf::from("/etc/tollgate/idp.pem"))
        );
    }

    #[test]
    fn system_store_is_populated() {
        assert!(!TrustStore::system().is_empty());
    }

    #[test]
    fn pem_store_loads_certificates() {
        let cert = self_signed(&["localhost"]);
        let store = store_for(&cert);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_pem_store_rejected() {
        let err = TrustStore::from_pem(TrustStoreRef::PemFile("empty.pem".into()), b"").unwrap_err();
        assert!(err.to_string().contains("no certificates"), "got: {err}");
    }

    #[test]
    fn missing_pem_file_rejected() {
        let reference = TrustStoreRef::PemFile("/definitely/not/here.pem".into());
        assert!(TrustStore::load(&reference).is_err());
    }

    #[test]
    fn pem_file_loaded_from_disk() {
        let cert = self_signed(&["localhost"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idp.pem");
        std::fs::write(&path, cert.cert.pem()).unwrap();
        let store = TrustStore::load(&TrustStoreRef::PemFile(path)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn trusted_chain_is_trusted() {
        let cert = self_signed(&["127.0.0.1", "localhost"]);
        let port = spawn_tls_server(&cert).await;
        let decision = TrustEvaluator::default()
            .evaluate("127.0.0.1", port, &store_for(&cert))
            .await;
        assert_eq!(decision, TrustDecision::Trusted);
    }

    #[tokio::test]
    async fn unknown_issuer_is_untrusted_chain() {
        let served = self_signed(&["127.0.0.1"]);
        let other = self_signed(&["127.0.0.1"]);
        let port = spawn_tls_server(&served).await;
        let decision = TrustEvaluator::default()
            .evaluate("127.0.0.1", port, &store_for(&other))
            .await;
        assert!(
            matches!(decision, TrustDecision::UntrustedChain(_)),
            "got {decision:?}"
        );
    }

    #[tokio::test]
    async fn hostname_mismatch_is_untrusted_chain() {
        let cert = self_signed(&["idp.example.com"]);
        let port = spawn_tls_server(&cert).await;
        let decision = TrustEvaluator::default()
            .evaluate("127.0.0.1", port, &store_for(&cert))
            .await;
        assert!(
            matches!(decision, TrustDecision::UntrustedChain(_)),
            "got {decision:?}"
        );
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cert = self_signed(&["127.0.0.1"]);
        let decision = TrustEvaluator::default()
            .evaluate("127.0.0.1", port, &store_for(&cert))
            .await;
        assert!(
            matches!(decision, TrustDecision::ConnectFailure(_)),
            "got {decision:?}"
        );
        assert!(!decision.is_trusted());
    }

    #[test]
    fn classify_finds_rustls_error_inside_io_error() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        let decision = classify_error(&io).unwrap();
        assert!(matches!(decision, TrustDecision::UntrustedChain(_)));
    }

    #[test]
    fn classify_finds_rustls_error_in_nested_io_errors() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature);
        let inner = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        let decision = classify_error(&outer).unwrap();
        assert!(matches!(decision, TrustDecision::UntrustedChain(_)), "got {decision:?}");
    }

    #[derive(Debug)]
    struct Wrapper(std::io::Error);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("client error (Connect)")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn classify_walks_through_wrapping_errors() {
        let tls = rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure);
        let inner = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        let err = Wrapper(std::io::Error::new(std::io::ErrorKind::Other, inner));
        let decision = classify_error(&err).unwrap();
        assert!(matches!(decision, TrustDecision::HandshakeFailure(_)), "got {decision:?}");
    }

    #[test]
    fn classify_ignores_plain_io_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(classify_error(&io).is_none());
    }
}
