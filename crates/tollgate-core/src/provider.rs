use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::{ProfileMapping, ProviderEntry, ProviderStyle, TokenAuthMethod, TransportConfig};
use crate::error::{Error, Result};
use crate::outcome::{Failure, FailureKind, TransportKind};
use crate::transport::{TransportClient, TransportFailure};
use crate::trust::{TrustStore, TrustStoreRef};

/// A fully resolved provider with all endpoints and configuration ready for use.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub name: String,
    pub style: ProviderStyle,
    pub issuer: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: Option<String>,
    pub jwks_uri: Option<String>,
    pub scopes: String,
    pub client_id: String,
    pub client_secret: String,
    pub profile_mapping: ProfileMapping,
    /// Extra query parameters for the auth URL.
    pub extra_auth_params: Vec<(String, String)>,
    /// Whether to send Accept: application/json on the token request (e.g., GitHub).
    pub token_request_accept_json: bool,
    /// Whether to always send grant_type on the token request.
    pub send_grant_type: bool,
    pub token_auth_method: TokenAuthMethod,
    pub trust_store: TrustStoreRef,
    pub use_system_proxy: bool,
}

impl fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("name", &self.name)
            .field("style", &self.style)
            .field("issuer", &self.issuer)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("userinfo_url", &self.userinfo_url)
            .field("jwks_uri", &self.jwks_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("token_auth_method", &self.token_auth_method)
            .field("trust_store", &self.trust_store)
            .field("use_system_proxy", &self.use_system_proxy)
            .finish_non_exhaustive()
    }
}

struct PresetConfig {
    style: ProviderStyle,
    issuer: Option<&'static str>,
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    jwks_uri: Option<&'static str>,
    scopes: &'static str,
    profile_mapping: ProfileMapping,
    token_request_accept_json: bool,
    send_grant_type: bool,
}

/// Built-in Google preset.
fn google_preset() -> PresetConfig {
    PresetConfig {
        style: ProviderStyle::Oidc,
        issuer: Some("https://accounts.google.com"),
        auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
        jwks_uri: Some("https://www.googleapis.com/oauth2/v3/certs"),
        scopes: "openid email profile",
        profile_mapping: oidc_profile_mapping(),
        token_request_accept_json: false,
        send_grant_type: true,
    }
}

/// Built-in GitHub preset.
fn github_preset() -> PresetConfig {
    PresetConfig {
        style: ProviderStyle::OAuth,
        issuer: None,
        auth_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        userinfo_url: "https://api.github.com/user",
        jwks_uri: None,
        scopes: "read:user user:email",
        profile_mapping: ProfileMapping {
            provider_id: "id".to_string(),
            email: Some("email".to_string()),
            email_verified: None,
            name: Some("name".to_string()),
        },
        token_request_accept_json: true,
        send_grant_type: false,
    }
}

/// Standard OIDC profile mapping using standard claims.
pub fn oidc_profile_mapping() -> ProfileMapping {
    ProfileMapping {
        provider_id: "sub".to_string(),
        email: Some("email".to_string()),
        email_verified: Some("email_verified".to_string()),
        name: Some("name".to_string()),
    }
}

/// OIDC discovery document fields we care about.
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: Option<String>,
    jwks_uri: Option<String>,
}

/// A provider together with the transport bound to its trust store.
pub struct Provider {
    pub config: ResolvedProvider,
    pub trust_store: TrustStore,
    pub transport: TransportClient,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn new(config: ResolvedProvider, transport: &TransportConfig) -> Result<Self> {
        let trust_store = TrustStore::load(&config.trust_store)?;
        let transport = TransportClient::new(&trust_store, config.use_system_proxy, transport)?;
        Ok(Self {
            config,
            trust_store,
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn style(&self) -> ProviderStyle {
        self.config.style
    }
}

/// Why discovery for a provider did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    Transport(TransportFailure),
    /// The provider answered, but not with a usable document.
    Invalid(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(t) => t.fmt(f),
            Self::Invalid(d) => f.write_str(d),
        }
    }
}

impl From<DiscoveryError> for Failure {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Transport(t) => {
                let mut failure = Failure::from(t);
                failure.detail = format!("discovery failed: {}", failure.detail);
                failure
            }
            DiscoveryError::Invalid(d) => Failure::new(
                FailureKind::Transport(TransportKind::Other),
                format!("discovery failed: {d}"),
            ),
        }
    }
}

/// A provider still waiting on its discovery document.
struct Undiscovered {
    provider: Provider,
    issuer: String,
    transport: TransportConfig,
    retry: tokio::sync::Mutex<()>,
}

impl Undiscovered {
    async fn discover(&self) -> std::result::Result<Provider, DiscoveryError> {
        let discovered = discover_oidc(&self.issuer, &self.provider.transport).await?;
        if discovered.issuer.trim_end_matches('/') != self.issuer.trim_end_matches('/') {
            return Err(DiscoveryError::Invalid(format!(
                "discovery issuer {} does not match configured {}",
                discovered.issuer, self.issuer
            )));
        }

        let mut cfg = self.provider.config.clone();
        if cfg.auth_url.is_empty() {
            cfg.auth_url = discovered.authorization_endpoint;
        }
        if cfg.token_url.is_empty() {
            cfg.token_url = discovered.token_endpoint;
        }
        cfg.userinfo_url = cfg.userinfo_url.take().or(discovered.userinfo_endpoint);
        cfg.jwks_uri = cfg.jwks_uri.take().or(discovered.jwks_uri);
        finish(&mut cfg).map_err(DiscoveryError::Invalid)?;

        Provider::new(cfg, &self.transport).map_err(|e| DiscoveryError::Invalid(e.to_string()))
    }
}

/// Configured providers, keyed by name.
///
/// A provider whose discovery fails at startup stays registered and is
/// discovered again the next time a login needs it.
#[derive(Default)]
pub struct ProviderRegistry {
    names: Vec<String>,
    ready: RwLock<HashMap<String, Arc<Provider>>>,
    deferred: HashMap<String, Arc<Undiscovered>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("names", &self.names)
            .field("ready", &self.ready().len())
            .finish_non_exhaustive()
    }
}

enum Resolution {
    Ready(Provider),
    Deferred(Undiscovered, DiscoveryError),
}

impl ProviderRegistry {
    pub fn from_providers(providers: impl IntoIterator<Item = Provider>) -> Self {
        let ready: HashMap<String, Arc<Provider>> = providers
            .into_iter()
            .map(|p| (p.config.name.clone(), Arc::new(p)))
            .collect();
        Self {
            names: ready.keys().cloned().collect(),
            ready: RwLock::new(ready),
            deferred: HashMap::new(),
        }
    }

    /// Resolve every configured provider. Discovery runs over the provider's
    /// own transport, so it is subject to the same trust store.
    pub async fn build(entries: &[ProviderEntry], transport: &TransportConfig) -> Result<Self> {
        let mut registry = Self::default();
        for entry in entries {
            registry.names.push(entry.name.clone());
            match resolve_provider(entry, transport).await? {
                Resolution::Ready(provider) => {
                    tracing::info!(
                        provider = %provider.config.name,
                        style = ?provider.config.style,
                        trust_store = %provider.config.trust_store,
                        proxy = provider.transport.proxy().unwrap_or("none"),
                        "provider loaded"
                    );
                    registry
                        .ready
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(entry.name.clone(), Arc::new(provider));
                }
                Resolution::Deferred(pending, err) => {
                    tracing::warn!(
                        provider = %entry.name,
                        issuer = %pending.issuer,
                        error = %err,
                        "provider discovery failed, retrying on first login"
                    );
                    registry.deferred.insert(entry.name.clone(), Arc::new(pending));
                }
            }
        }
        Ok(registry)
    }

    fn ready(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Provider>>> {
        self.ready.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// A provider whose endpoints are known.
    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.ready().get(name).cloned()
    }

    /// Like [`get`](Self::get), but retries discovery for a provider that has
    /// not completed it. `None` means no such provider is configured.
    pub async fn resolve(&self, name: &str) -> Option<std::result::Result<Arc<Provider>, Failure>> {
        if let Some(provider) = self.get(name) {
            return Some(Ok(provider));
        }
        let pending = self.deferred.get(name)?;
        let _retry = pending.retry.lock().await;
        if let Some(provider) = self.get(name) {
            return Some(Ok(provider));
        }

        let result = match pending.discover().await {
            Ok(provider) => {
                tracing::info!(provider = name, "provider discovered");
                let provider = Arc::new(provider);
                self.ready
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), provider.clone());
                Ok(provider)
            }
            Err(err) => Err(Failure::from(err)),
        };
        Some(result)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

async fn resolve_provider(entry: &ProviderEntry, transport: &TransportConfig) -> Result<Resolution> {
    let client_id = entry.client_id.resolve()?;
    let client_secret = entry.client_secret.resolve()?;
    let extra_auth_params: Vec<(String, String)> = entry
        .extra_auth_params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let base = ResolvedProvider {
        name: entry.name.clone(),
        style: entry.style(),
        issuer: entry.issuer.clone(),
        auth_url: entry.auth_url.clone().unwrap_or_default(),
        token_url: entry.token_url.clone().unwrap_or_default(),
        userinfo_url: entry.userinfo_url.clone(),
        jwks_uri: entry.jwks_uri.clone(),
        scopes: entry.scopes.clone().unwrap_or_default(),
        client_id,
        client_secret,
        profile_mapping: entry
            .profile_mapping
            .clone()
            .unwrap_or_else(oidc_profile_mapping),
        extra_auth_params,
        token_request_accept_json: entry.token_request_accept_json,
        send_grant_type: true,
        token_auth_method: entry.token_endpoint_auth_method,
        trust_store: entry.trust_store.clone(),
        use_system_proxy: entry.use_system_properties_for_http_client_connections,
    };

    if entry.is_preset() {
        let preset = match entry.name.as_str() {
            "google" => google_preset(),
            _ => github_preset(),
        };
        let resolved = ResolvedProvider {
            style: entry.style.unwrap_or(preset.style),
            issuer: preset.issuer.map(String::from),
            auth_url: preset.auth_url.to_string(),
            token_url: preset.token_url.to_string(),
            userinfo_url: entry
                .userinfo_url
                .clone()
                .or_else(|| Some(preset.userinfo_url.to_string())),
            jwks_uri: entry
                .jwks_uri
                .clone()
                .or_else(|| preset.jwks_uri.map(String::from)),
            scopes: entry.scopes.clone().unwrap_or_else(|| preset.scopes.to_string()),
            profile_mapping: entry
                .profile_mapping
                .clone()
                .unwrap_or(preset.profile_mapping),
            token_request_accept_json: preset.token_request_accept_json,
            send_grant_type: preset.send_grant_type,
            ..base
        };
        return Provider::new(resolved, transport).map(Resolution::Ready);
    }

    let mut provider = Provider::new(base, transport)?;
    let needs_discovery = provider.config.auth_url.is_empty()
        || provider.config.token_url.is_empty()
        || (provider.config.style == ProviderStyle::Oidc && provider.config.jwks_uri.is_none());

    match entry.issuer.clone() {
        Some(issuer) if needs_discovery => {
            let pending = Undiscovered {
                provider,
                issuer,
                transport: transport.clone(),
                retry: tokio::sync::Mutex::new(()),
            };
            Ok(match pending.discover().await {
                Ok(provider) => Resolution::Ready(provider),
                Err(err) => Resolution::Deferred(pending, err),
            })
        }
        _ => {
            finish(&mut provider.config)
                .map_err(|d| Error::Config(format!("provider '{}': {d}", entry.name)))?;
            Ok(Resolution::Ready(provider))
        }
    }
}

/// Fill defaults and check the endpoints the provider's style depends on.
fn finish(cfg: &mut ResolvedProvider) -> std::result::Result<(), String> {
    if cfg.scopes.is_empty() && cfg.style == ProviderStyle::Oidc {
        cfg.scopes = "openid email profile".to_string();
    }
    if cfg.style == ProviderStyle::Oidc && cfg.jwks_uri.is_none() {
        return Err("no jwks_uri configured or discovered".to_string());
    }
    if cfg.style == ProviderStyle::OAuth && cfg.userinfo_url.is_none() {
        return Err("no userinfo_url configured or discovered".to_string());
    }
    Ok(())
}

/// Fetch OIDC discovery document from `{issuer}/.well-known/openid-configuration`.
async fn discover_oidc(
    issuer: &str,
    transport: &TransportClient,
) -> std::result::Result<OidcDiscovery, DiscoveryError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let resp = transport
        .send(transport.http().get(&url), None)
        .await
        .map_err(DiscoveryError::Transport)?;

    if !resp.status().is_success() {
        return Err(DiscoveryError::Invalid(format!(
            "discovery returned HTTP {}",
            resp.status()
        )));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| DiscoveryError::Transport(transport.classify(&e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| DiscoveryError::Invalid(format!("discovery parse failed: {e}")))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a random state parameter (256 bits, base64url).
pub fn generate_state() -> String {
    random_token()
}

/// Generate an OIDC nonce.
pub fn generate_nonce() -> String {
    random_token()
}

/// Generate PKCE code verifier and challenge.
pub fn generate_pkce() -> (String, String) {
    let verifier = random_token();
    let challenge = {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    };
    (verifier, challenge)
}

/// Build the authorization redirect URL for a provider.
pub fn build_auth_url(
    provider: &ResolvedProvider,
    callback_url: &str,
    state: &str,
    code_challenge: &str,
    nonce: Option<&str>,
) -> Result<String> {
    let mut url = url::Url::parse(&provider.auth_url)
        .map_err(|e| Error::Config(format!("provider '{}': invalid auth URL: {e}", provider.name)))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("client_id", &provider.client_id);
        params.append_pair("redirect_uri", callback_url);
        params.append_pair("response_type", "code");
        params.append_pair("state", state);
        if !provider.scopes.is_empty() {
            params.append_pair("scope", &provider.scopes);
        }
        params.append_pair("code_challenge", code_challenge);
        params.append_pair("code_challenge_method", "S256");
        if let Some(nonce) = nonce {
            params.append_pair("nonce", nonce);
        }

        for (key, value) in &provider.extra_auth_params {
            params.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}
