use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::outcome::MessageId;
use crate::trust::TrustStoreRef;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub jwks: JwksConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL for this service. Callback URLs registered with each
    /// provider are `{public_url}/login/{provider}/callback`.
    pub public_url: String,
    #[serde(default = "default_cookie_prefix")]
    pub cookie_prefix: String,
    /// Set the `Secure` attribute on the session cookie.
    #[serde(default)]
    pub secure_cookies: bool,
}

impl ServerConfig {
    pub fn callback_url(&self, provider: &str) -> String {
        format!(
            "{}/login/{provider}/callback",
            self.public_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Upper bound on logins awaiting their callback.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            max_pending: default_max_pending(),
        }
    }
}

impl FlowConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Proxy used by providers that honor system proxy settings. When unset,
    /// the `HTTPS_PROXY` / `ALL_PROXY` environment variables apply.
    pub proxy_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            proxy_url: None,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwksConfig {
    #[serde(default = "default_jwks_ttl")]
    pub cache_ttl_secs: u64,
    /// Leeway applied to `exp` and `nbf`.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_jwks_ttl(),
            clock_skew_secs: default_clock_skew(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: ConfigValue,
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Optional bearer token required to scrape `/metrics`.
    pub bearer_token: Option<ConfigValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservabilityConfig {
    /// Message ids logged as expected (info, not warn) while shutting down.
    #[serde(default)]
    pub expected_during_quiesce: Vec<String>,
}

impl ObservabilityConfig {
    pub fn expected_ids(&self) -> Result<Vec<MessageId>> {
        self.expected_during_quiesce
            .iter()
            .map(|s| s.parse())
            .collect()
    }
}

/// How a provider proves who the user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStyle {
    /// Plain OAuth2: identity comes from the userinfo endpoint.
    OAuth,
    /// OpenID Connect: identity comes from a JWKS-verified ID token.
    Oidc,
}

/// Field names used to extract a principal from provider claims.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileMapping {
    #[serde(alias = "user_name_attribute")]
    pub provider_id: String,
    pub email: Option<String>,
    pub email_verified: Option<String>,
    pub name: Option<String>,
}

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAuthMethod {
    /// `client_id` and `client_secret` in the form body.
    #[default]
    ClientSecretPost,
    /// HTTP Basic `Authorization` header.
    ClientSecretBasic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub style: Option<ProviderStyle>,
    /// OIDC issuer. Enables discovery of endpoints not configured explicitly.
    pub issuer: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    pub jwks_uri: Option<String>,
    pub client_id: ConfigValue,
    pub client_secret: ConfigValue,
    pub scopes: Option<String>,
    #[serde(default)]
    pub trust_store: TrustStoreRef,
    #[serde(default)]
    pub use_system_properties_for_http_client_connections: bool,
    pub profile_mapping: Option<ProfileMapping>,
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
    #[serde(default)]
    pub token_request_accept_json: bool,
    #[serde(default)]
    pub token_endpoint_auth_method: TokenAuthMethod,
}

impl ProviderEntry {
    /// Explicit style, else OIDC when an issuer or JWKS URI is configured.
    pub fn style(&self) -> ProviderStyle {
        match self.style {
            Some(style) => style,
            None if self.issuer.is_some() || self.jwks_uri.is_some() => ProviderStyle::Oidc,
            None if self.is_preset() => preset_style(&self.name),
            None => ProviderStyle::OAuth,
        }
    }

    /// Built-in endpoints apply when a well-known name has no endpoints of its own.
    pub fn is_preset(&self) -> bool {
        matches!(self.name.as_str(), "google" | "github")
            && self.issuer.is_none()
            && self.auth_url.is_none()
            && self.token_url.is_none()
    }
}

fn preset_style(name: &str) -> ProviderStyle {
    match name {
        "google" => ProviderStyle::Oidc,
        _ => ProviderStyle::OAuth,
    }
}

/// A protected path served once the user has a session for `provider`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    pub path: String,
    pub provider: String,
    pub body: Option<String>,
}

/// One year.
const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 3600;

/// Paths owned by the service itself.
const RESERVED_PREFIXES: &[&str] = &["/login", "/health", "/metrics"];

// --- ConfigValue: supports "env:VAR_NAME" syntax ---

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    pub fn resolve(&self) -> Result<String> {
        let ConfigValue::Literal(s) = self;
        if let Some(var_name) = s.strip_prefix("env:") {
            std::env::var(var_name).map_err(|_| {
                Error::Config(format!("environment variable {var_name} not set"))
            })
        } else {
            Ok(s.clone())
        }
    }
}

// --- Config resolution ---

const CONFIG_FILENAME: &str = "tollgate.toml";
const CONFIG_ENV_VAR: &str = "TOLLGATE_CONFIG";

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flow.state_ttl_secs == 0 {
            return Err(Error::Config("flow.state_ttl_secs must be at least 1".to_string()));
        }
        if self.flow.max_pending == 0 {
            return Err(Error::Config("flow.max_pending must be at least 1".to_string()));
        }
        if self.flow.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "flow.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.transport.request_timeout_ms == 0 {
            return Err(Error::Config(
                "transport.request_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "transport.connect_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.jwks.cache_ttl_secs == 0 {
            return Err(Error::Config("jwks.cache_ttl_secs must be at least 1".to_string()));
        }
        if self.session.ttl_secs == 0 || self.session.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(Error::Config(format!(
                "session.ttl_secs must be between 1 and {MAX_SESSION_TTL_SECS}"
            )));
        }
        if self.session.secret.resolve()?.len() < 32 {
            return Err(Error::Config(
                "session.secret must be at least 32 bytes".to_string(),
            ));
        }
        url::Url::parse(&self.server.public_url)
            .map_err(|e| Error::Config(format!("server.public_url is invalid: {e}")))?;
        self.observability.expected_ids()?;

        let mut names = HashSet::new();
        for (i, entry) in self.providers.iter().enumerate() {
            if !names.insert(entry.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate provider name: \"{}\"",
                    entry.name
                )));
            }
            validate_provider(i, entry)?;
        }

        let mut paths = HashSet::new();
        for (i, resource) in self.resources.iter().enumerate() {
            if !resource.path.starts_with('/') {
                return Err(Error::Config(format!(
                    "resources[{i}].path must start with '/': {}",
                    resource.path
                )));
            }
            // Served as literal routes; no captures or wildcards
            if resource.path.contains(['{', '}', '*'])
                || resource.path.split('/').any(|seg| seg.starts_with(':'))
            {
                return Err(Error::Config(format!(
                    "resources[{i}].path must be a literal path: {}",
                    resource.path
                )));
            }
            if RESERVED_PREFIXES
                .iter()
                .any(|p| resource.path == *p || resource.path.starts_with(&format!("{p}/")))
            {
                return Err(Error::Config(format!(
                    "resources[{i}].path collides with a built-in route: {}",
                    resource.path
                )));
            }
            if !paths.insert(resource.path.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate resource path: {}",
                    resource.path
                )));
            }
            if !names.contains(resource.provider.as_str()) {
                return Err(Error::Config(format!(
                    "resources[{i}] references unknown provider \"{}\"",
                    resource.provider
                )));
            }
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.name == name)
    }
}

fn validate_provider(i: usize, entry: &ProviderEntry) -> Result<()> {
    let field = |name: &str| format!("providers[{i}] ({}): {name}", entry.name);

    if entry.name.is_empty()
        || !entry
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(Error::Config(format!(
            "providers[{i}].name must be non-empty and use only letters, digits, '-' or '_': \"{}\"",
            entry.name
        )));
    }

    for (name, value) in [
        ("auth_url", &entry.auth_url),
        ("token_url", &entry.token_url),
        ("userinfo_url", &entry.userinfo_url),
        ("jwks_uri", &entry.jwks_uri),
        ("issuer", &entry.issuer),
    ] {
        if let Some(url) = value {
            if url.trim().is_empty() {
                return Err(Error::Config(format!("{} is empty", field(name))));
            }
            url::Url::parse(url)
                .map_err(|e| Error::Config(format!("{} is not a valid URL: {e}", field(name))))?;
        }
    }

    entry.client_id.resolve()?;
    entry.client_secret.resolve()?;

    if entry.is_preset() {
        return Ok(());
    }

    // Without an issuer there is no discovery, so endpoints must be explicit
    if entry.issuer.is_none() {
        if entry.auth_url.is_none() {
            return Err(Error::Config(format!("{} is required", field("auth_url"))));
        }
        if entry.token_url.is_none() {
            return Err(Error::Config(format!("{} is required", field("token_url"))));
        }
    }

    match entry.style() {
        ProviderStyle::Oidc => {
            // ID tokens are checked against the issuer; the JWKS URI can be discovered from it
            if entry.issuer.is_none() {
                return Err(Error::Config(format!(
                    "{} is required for oidc providers",
                    field("issuer")
                )));
            }
        }
        ProviderStyle::OAuth => {
            if entry.userinfo_url.is_none() && entry.issuer.is_none() {
                return Err(Error::Config(format!(
                    "{} is required for oauth providers",
                    field("userinfo_url")
                )));
            }
            if entry.profile_mapping.is_none() {
                return Err(Error::Config(format!(
                    "{} is required for oauth providers",
                    field("profile_mapping")
                )));
            }
        }
    }
    Ok(())
}

/// Resolve config file location using the standard search order:
/// 1. Explicit path (CLI flag)
/// 2. TOLLGATE_CONFIG env var
/// 3. Current directory
/// 4. Walk up parent directories
/// 5. ~/.config/tollgate/config.toml
/// 6. /etc/tollgate/config.toml
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut searched = Vec::new();

    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        return Err(Error::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join(CONFIG_FILENAME);
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("tollgate").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    let system_config = PathBuf::from("/etc/tollgate/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}

// --- Defaults ---

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_cookie_prefix() -> String { "tollgate".to_string() }
fn default_state_ttl() -> u64 { 300 }          // 5 minutes
fn default_sweep_interval() -> u64 { 30 }
fn default_max_pending() -> usize { 10_000 }
fn default_request_timeout() -> u64 { 10_000 }
fn default_connect_timeout() -> u64 { 5_000 }
fn default_jwks_ttl() -> u64 { 300 }
fn default_clock_skew() -> u64 { 60 }
fn default_session_ttl() -> u64 { 3600 }       // 1 hour
fn default_issuer() -> String { "tollgate".to_string() }
