//! Outbound HTTPS to identity providers.
//!
//! One [`TransportClient`] per provider. TLS is always verified against the
//! provider's trust store, proxying is decided once at construction, and no
//! request is ever retried.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::outcome::{Failure, FailureKind, TransportKind};
use crate::trust::{TrustDecision, TrustEvaluator, TrustStore, classify_error};

const PROXY_ENV_VARS: &[&str] = &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// TLS did not complete. Carries the trust evaluator's classification.
    Handshake(TrustDecision),
    ProxyUnreachable(String),
    Timeout(String),
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake(decision) => write!(
                f,
                "TLS handshake failed: {}",
                decision.reason().unwrap_or("trusted")
            ),
            Self::ProxyUnreachable(d) => write!(f, "proxy unreachable: {d}"),
            Self::Timeout(d) => write!(f, "timed out: {d}"),
            Self::Connect(d) => write!(f, "connection failed: {d}"),
            Self::Other(d) => write!(f, "request failed: {d}"),
        }
    }
}

impl From<TransportFailure> for Failure {
    fn from(failure: TransportFailure) -> Self {
        let detail = failure.to_string();
        let kind = match failure {
            TransportFailure::Handshake(_) => FailureKind::HandshakeFailure,
            TransportFailure::ProxyUnreachable(_) => {
                FailureKind::Transport(TransportKind::ProxyUnreachable)
            }
            TransportFailure::Timeout(_) => FailureKind::Transport(TransportKind::Timeout),
            TransportFailure::Connect(_) => FailureKind::Transport(TransportKind::Connect),
            TransportFailure::Other(_) => FailureKind::Transport(TransportKind::Other),
        };
        Failure::new(kind, detail)
    }
}

/// Pick the proxy a provider's calls go through, if any.
///
/// `honor` is the provider's `use_system_properties_for_http_client_connections`
/// flag. When it is off the environment is ignored entirely.
pub fn resolve_proxy(honor: bool, configured: Option<&str>) -> Option<String> {
    if !honor {
        return None;
    }
    if let Some(url) = configured.filter(|u| !u.is_empty()) {
        return Some(url.to_string());
    }
    PROXY_ENV_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

pub struct TransportClient {
    http: Client,
    proxy: Option<String>,
    request_timeout: Duration,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("proxy", &self.proxy)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    pub fn new(store: &TrustStore, honor_system_proxy: bool, config: &TransportConfig) -> Result<Self> {
        let tls = TrustEvaluator::client_config(store)?;
        let mut builder = Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")));

        let proxy = resolve_proxy(honor_system_proxy, config.proxy_url.as_deref());
        builder = match &proxy {
            Some(url) => {
                let mut p = reqwest::Proxy::all(url)
                    .map_err(|e| Error::HttpClient(format!("invalid proxy {url}: {e}")))?;
                // NO_PROXY only scopes proxies that came from the environment
                if config.proxy_url.is_none() {
                    p = p.no_proxy(reqwest::NoProxy::from_env());
                }
                builder.proxy(p)
            }
            None => builder.no_proxy(),
        };

        let http = builder
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;

        Ok(Self {
            http,
            proxy,
            request_timeout: config.request_timeout(),
        })
    }

    /// The underlying client, for building requests passed to [`send`](Self::send).
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send once. `timeout` overrides the configured request timeout.
    pub async fn send(
        &self,
        request: RequestBuilder,
        timeout: Option<Duration>,
    ) -> std::result::Result<Response, TransportFailure> {
        let timeout = timeout.unwrap_or(self.request_timeout);
        request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.classify(&e))
    }

    /// Classify a reqwest error from this client, including errors raised
    /// while reading a response body.
    pub fn classify(&self, err: &reqwest::Error) -> TransportFailure {
        if let Some(decision) = classify_error(err) {
            return TransportFailure::Handshake(decision);
        }
        let detail = error_chain(err);
        if err.is_timeout() {
            TransportFailure::Timeout(detail)
        } else if err.is_connect() {
            match &self.proxy {
                Some(proxy) => TransportFailure::ProxyUnreachable(format!("{proxy}: {detail}")),
                None => TransportFailure::Connect(detail),
            }
        } else {
            TransportFailure::Other(detail)
        }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::trust::TrustStoreRef;

    fn config() -> TransportConfig {
        TransportConfig {
            request_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            proxy_url: None,
        }
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn proxy_ignored_when_not_honored() {
        assert_eq!(resolve_proxy(false, Some("http://proxy:3128")), None);
    }

    #[test]
    fn configured_proxy_wins() {
        assert_eq!(
            resolve_proxy(true, Some("http://proxy:3128")).as_deref(),
            Some("http://proxy:3128")
        );
    }

    #[tokio::test]
    async fn plain_request_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
            .mount(&server)
            .await;

        let client = TransportClient::new(&TrustStore::system(), false, &config()).unwrap();
        let resp = client
            .send(client.http().get(format!("{}/ok", server.uri())), None)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = TransportClient::new(&TrustStore::system(), false, &config()).unwrap();
        let err = client
            .send(
                client.http().get(server.uri()),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportFailure::Timeout(_)), "got {err:?}");
        let failure = Failure::from(err);
        assert_eq!(failure.kind, FailureKind::Transport(TransportKind::Timeout));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_failure() {
        let port = dead_port().await;
        let client = TransportClient::new(&TrustStore::system(), false, &config()).unwrap();
        let err = client
            .send(client.http().get(format!("http://127.0.0.1:{port}/")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportFailure::Connect(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_proxy_is_reported_not_bypassed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut cfg = config();
        cfg.proxy_url = Some(format!("http://127.0.0.1:{}", dead_port().await));

        let proxied = TransportClient::new(&TrustStore::system(), true, &cfg).unwrap();
        assert!(proxied.proxy().is_some());
        let err = proxied
            .send(proxied.http().get(server.uri()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportFailure::ProxyUnreachable(_)), "got {err:?}");

        // Same settings with the flag off go straight to the server
        let direct = TransportClient::new(&TrustStore::system(), false, &cfg).unwrap();
        assert!(direct.proxy().is_none());
        let resp = direct.send(direct.http().get(server.uri()), None).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn untrusted_certificate_is_handshake_failure() {
        let served = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(served.key_pair.serialize_der()));
        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![served.cert.der().clone()], key)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _ = acceptor.accept(tcp).await;
                });
            }
        });

        let other = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let store = TrustStore::from_pem(
            TrustStoreRef::PemFile("other.pem".into()),
            other.cert.pem().as_bytes(),
        )
        .unwrap();
        let client = TransportClient::new(&store, false, &config()).unwrap();
        let err = client
            .send(client.http().get(format!("https://127.0.0.1:{port}/token")), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportFailure::Handshake(TrustDecision::UntrustedChain(_))),
            "got {err:?}"
        );
        assert_eq!(Failure::from(err).kind, FailureKind::HandshakeFailure);
    }
}
