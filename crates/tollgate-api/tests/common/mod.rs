#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::fmt::MakeWriter;

use tollgate_api::server::AppState;
use tollgate_core::config::Config;

pub use reqwest::{Client, StatusCode};

pub const CLIENT_ID: &str = "client01";
pub const CLIENT_SECRET: &str = "s3cr3t-client-value";
pub const SESSION_SECRET: &str = "test-session-secret-0123456789abcdef";
pub const DEFAULT_TRANSPORT: &str = "request_timeout_ms = 2000\nconnect_timeout_ms = 1000";

// --- Mock identity provider ---

#[derive(Clone, Default)]
pub struct IdpOptions {
    pub tls: bool,
    pub token_delay: Duration,
}

struct IdpState {
    issuer: String,
    encoding: EncodingKey,
    jwk: serde_json::Value,
    /// Issued codes and the nonce each was bound to.
    codes: Mutex<HashMap<String, Option<String>>>,
    next_code: AtomicUsize,
    token_calls: AtomicUsize,
    token_delay: Duration,
}

/// An OAuth/OIDC provider on `127.0.0.1:0` with authorize, token, userinfo,
/// JWKS and discovery endpoints.
pub struct MockIdp {
    pub base: String,
    cert_pem: Option<String>,
    state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start() -> Self {
        Self::start_with(IdpOptions::default()).await
    }

    pub async fn start_tls() -> Self {
        Self::start_with(IdpOptions {
            tls: true,
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(options: IdpOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().unwrap();
        let scheme = if options.tls { "https" } else { "http" };
        let base = format!("{scheme}://{addr}");

        let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let encoding = EncodingKey::from_ec_pem(pair.serialize_pem().as_bytes()).unwrap();
        let raw = pair.public_key_raw();
        let jwk = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "kid": "idp-key-1",
            "alg": "ES256",
            "use": "sig",
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        });

        let state = Arc::new(IdpState {
            issuer: base.clone(),
            encoding,
            jwk,
            codes: Mutex::new(HashMap::new()),
            next_code: AtomicUsize::new(1),
            token_calls: AtomicUsize::new(0),
            token_delay: options.token_delay,
        });

        let app = Router::new()
            .route("/authorize", get(idp_authorize))
            .route("/token", post(idp_token))
            .route("/userinfo", get(idp_userinfo))
            .route("/jwks", get(idp_jwks))
            .route("/.well-known/openid-configuration", get(idp_discovery))
            .with_state(state.clone());

        let cert_pem = if options.tls {
            let cert = rcgen::generate_simple_self_signed(vec![
                "127.0.0.1".to_string(),
                "localhost".to_string(),
            ])
            .unwrap();
            spawn_tls(listener, app, &cert);
            Some(cert.cert.pem())
        } else {
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            None
        };

        Self {
            base,
            cert_pem,
            state,
        }
    }

    pub fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    /// Write this provider's certificate to `dir` for use as a trust store.
    pub fn write_cert(&self, dir: &Path) -> PathBuf {
        let path = dir.join("idp.pem");
        std::fs::write(&path, self.cert_pem.as_deref().expect("not a TLS idp")).unwrap();
        path
    }

    /// A browser that follows nothing by itself and trusts this provider.
    /// Fresh per call so cookies never bleed between browsers.
    pub fn browser(&self) -> Client {
        let mut builder = Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        if let Some(pem) = &self.cert_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes()).unwrap());
        }
        builder.build().unwrap()
    }

    /// `[[providers]]` entry for an OIDC provider backed by this idp.
    pub fn oidc_provider(&self, name: &str, trust_store: &str) -> String {
        let base = &self.base;
        format!(
            r#"
[[providers]]
name = "{name}"
style = "oidc"
issuer = "{base}"
auth_url = "{base}/authorize"
token_url = "{base}/token"
userinfo_url = "{base}/userinfo"
jwks_uri = "{base}/jwks"
client_id = "{CLIENT_ID}"
client_secret = "{CLIENT_SECRET}"
trust_store = "{trust_store}"
"#
        )
    }

    /// OIDC entry with only the issuer; endpoints come from discovery.
    pub fn discovered_provider(&self, name: &str, trust_store: &str) -> String {
        let base = &self.base;
        format!(
            r#"
[[providers]]
name = "{name}"
issuer = "{base}"
client_id = "{CLIENT_ID}"
client_secret = "{CLIENT_SECRET}"
trust_store = "{trust_store}"
"#
        )
    }

    /// Plain OAuth entry; identity comes from userinfo's `login`.
    pub fn oauth_provider(&self, name: &str, trust_store: &str, honor_proxy: bool) -> String {
        let base = &self.base;
        format!(
            r#"
[[providers]]
name = "{name}"
style = "oauth"
auth_url = "{base}/authorize"
token_url = "{base}/token"
userinfo_url = "{base}/userinfo"
client_id = "{CLIENT_ID}"
client_secret = "{CLIENT_SECRET}"
trust_store = "{trust_store}"
use_system_properties_for_http_client_connections = {honor_proxy}

[providers.profile_mapping]
user_name_attribute = "login"
email = "email"
"#
        )
    }
}

async fn idp_authorize(
    State(state): State<Arc<IdpState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(redirect_uri), Some(oauth_state)) = (params.get("redirect_uri"), params.get("state"))
    else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri or state").into_response();
    };
    let code = format!("code-{}", state.next_code.fetch_add(1, Ordering::SeqCst));
    state
        .codes
        .lock()
        .unwrap()
        .insert(code.clone(), params.get("nonce").cloned());

    let mut location = url::Url::parse(redirect_uri).unwrap();
    location
        .query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", oauth_state);
    (StatusCode::FOUND, [(axum::http::header::LOCATION, location.to_string())]).into_response()
}

async fn idp_token(
    State(state): State<Arc<IdpState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    if !state.token_delay.is_zero() {
        tokio::time::sleep(state.token_delay).await;
    }

    let credentials_ok = form.get("client_id").map(String::as_str) == Some(CLIENT_ID)
        && form.get("client_secret").map(String::as_str) == Some(CLIENT_SECRET);
    let nonce = form
        .get("code")
        .and_then(|code| state.codes.lock().unwrap().remove(code));
    let (true, Some(nonce)) = (credentials_ok, nonce) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid_grant" })),
        )
            .into_response();
    };

    let now = chrono::Utc::now().timestamp();
    let mut claims = serde_json::json!({
        "iss": state.issuer,
        "aud": CLIENT_ID,
        "sub": "user1",
        "email": "user1@example.com",
        "iat": now,
        "exp": now + 300,
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = serde_json::Value::String(nonce);
    }
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some("idp-key-1".to_string());
    let id_token = jsonwebtoken::encode(&header, &claims, &state.encoding).unwrap();

    Json(serde_json::json!({
        "access_token": "at-user1",
        "token_type": "Bearer",
        "expires_in": 3600,
        "id_token": id_token,
    }))
    .into_response()
}

async fn idp_userinfo(headers: HeaderMap) -> Response {
    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer at-user1");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(serde_json::json!({
        "sub": "user1",
        "login": "octo-user1",
        "email": "user1@example.com",
    }))
    .into_response()
}

async fn idp_jwks(State(state): State<Arc<IdpState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "keys": [state.jwk] }))
}

async fn idp_discovery(State(state): State<Arc<IdpState>>) -> Json<serde_json::Value> {
    let base = &state.issuer;
    Json(serde_json::json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "userinfo_endpoint": format!("{base}/userinfo"),
        "jwks_uri": format!("{base}/jwks"),
    }))
}

fn spawn_tls(listener: TcpListener, app: Router, cert: &rcgen::CertifiedKey) {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key)
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else { break };
            let acceptor = acceptor.clone();
            let app = app.clone();
            tokio::spawn(async move {
                // Untrusting clients abort here
                let Ok(tls) = acceptor.accept(tcp).await else { return };
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), TowerToHyperService::new(app))
                    .await;
            });
        }
    });
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// --- Tollgate under test ---

/// Build a validated config. `transport` is the body of the `[transport]`
/// table; `rest` holds providers, resources and anything else.
pub fn build_config(public_url: &str, transport: &str, rest: &str) -> Config {
    let text = format!(
        r#"
[server]
host = "127.0.0.1"
port = 0
public_url = "{public_url}"

[session]
secret = "{SESSION_SECRET}"

[transport]
{transport}
{rest}"#
    );
    let config: Config = toml::from_str(&text).expect("test config should parse");
    config.validate().expect("test config should validate");
    config
}

pub fn resource(path: &str, provider: &str) -> String {
    format!("\n[[resources]]\npath = \"{path}\"\nprovider = \"{provider}\"\n")
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    /// Start tollgate on `127.0.0.1:0`. `config` receives the public URL.
    pub async fn start(config: impl FnOnce(&str) -> Config) -> Self {
        Self::start_with_metrics(config, None).await
    }

    pub async fn start_with_metrics(
        config: impl FnOnce(&str) -> Config,
        metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().unwrap();
        let config = config(&format!("http://{addr}"));
        let state = AppState::build(config, metrics_handle)
            .await
            .expect("app state should build");

        let app = tollgate_api::app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Walk from `start_path` through the provider's authorize endpoint and
    /// return the callback URL the provider sent the browser back to.
    pub async fn authorize(&self, browser: &Client, start_path: &str) -> String {
        let resp = browser.get(self.url(start_path)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND, "start should redirect");
        let resp = browser.get(location(&resp)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND, "authorize should redirect");
        location(&resp)
    }
}

pub fn location(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(reqwest::header::LOCATION)
        .expect("response has no Location")
        .to_str()
        .unwrap()
        .to_string()
}

/// `name=value` of the session cookie set on `resp`, if any.
pub fn session_cookie(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("tollgate_session="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

/// Query parameter `name` of `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

// --- Log capture ---

/// JSON log lines written while the guard from [`install`](Self::install) lives.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(self.0.clone())
    }
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn records(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Records carrying a message id, one per finished login.
    pub fn outcomes(&self) -> Vec<serde_json::Value> {
        self.records()
            .into_iter()
            .filter(|r| r["fields"]["message_id"].is_string())
            .collect()
    }

    pub fn outcome_ids(&self) -> Vec<String> {
        self.outcomes()
            .iter()
            .map(|r| r["fields"]["message_id"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}
