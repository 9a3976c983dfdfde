//! The login state machine: redirect, callback, exchange, validate.
//!
//! Each flow is `AwaitingCallback` from [`FlowCoordinator::begin_login`] until
//! its state token is redeemed or swept. The pending request is removed
//! before any network call is made, so a flow that fails or is cancelled
//! midway leaves nothing behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::{Config, ProviderStyle};
use crate::error::{Error, Result};
use crate::exchange::TokenExchanger;
use crate::jwks::{Expectation, JwksCache, JwksValidator};
use crate::outcome::{Claims, Failure, FailureKind, OutcomeLogger, TokenCheck, ValidationOutcome};
use crate::pending::{AuthorizationRequest, PendingStore, StoreFull, TakeError};
use crate::provider::{self, Provider, ProviderRegistry};
use crate::userinfo::{fetch_userinfo, parse_profile};

/// Where to send the browser to start a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInstruction {
    pub location: String,
    pub state: String,
}

/// Query parameters the provider sends back to the callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub public_url: String,
    pub state_ttl: Duration,
    pub max_pending: usize,
    pub jwks_cache_ttl: Duration,
    pub clock_skew_secs: u64,
}

impl FlowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            public_url: config.server.public_url.clone(),
            state_ttl: config.flow.state_ttl(),
            max_pending: config.flow.max_pending,
            jwks_cache_ttl: Duration::from_secs(config.jwks.cache_ttl_secs),
            clock_skew_secs: config.jwks.clock_skew_secs,
        }
    }

    fn callback_url(&self, provider: &str) -> String {
        format!(
            "{}/login/{provider}/callback",
            self.public_url.trim_end_matches('/')
        )
    }
}

pub struct FlowCoordinator {
    settings: FlowSettings,
    providers: Arc<ProviderRegistry>,
    pending: PendingStore,
    exchanger: TokenExchanger,
    validator: JwksValidator,
    logger: Arc<OutcomeLogger>,
}

impl FlowCoordinator {
    pub fn new(
        settings: FlowSettings,
        providers: Arc<ProviderRegistry>,
        logger: Arc<OutcomeLogger>,
    ) -> Self {
        let cache = Arc::new(JwksCache::new(settings.jwks_cache_ttl));
        Self {
            pending: PendingStore::new(settings.state_ttl, settings.max_pending),
            validator: JwksValidator::new(cache, settings.clock_skew_secs),
            exchanger: TokenExchanger::new(),
            settings,
            providers,
            logger,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn logger(&self) -> &Arc<OutcomeLogger> {
        &self.logger
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    /// Start a login for `target` with `provider_name`.
    ///
    /// A provider that cannot be discovered fails here with one outcome
    /// record and [`Error::Unauthorized`].
    pub async fn begin_login(&self, target: &str, provider_name: &str) -> Result<RedirectInstruction> {
        let provider = match self.providers.resolve(provider_name).await {
            None => return Err(Error::UnknownProvider(provider_name.to_string())),
            Some(Ok(provider)) => provider,
            Some(Err(failure)) => {
                self.logger
                    .record(provider_name, &ValidationOutcome::Failure(failure));
                return Err(Error::Unauthorized);
            }
        };
        let cfg = &provider.config;

        let state = provider::generate_state();
        let (pkce_verifier, code_challenge) = provider::generate_pkce();
        let nonce = (cfg.style == ProviderStyle::Oidc).then(provider::generate_nonce);
        let redirect_uri = self.settings.callback_url(&cfg.name);

        let location = provider::build_auth_url(
            cfg,
            &redirect_uri,
            &state,
            &code_challenge,
            nonce.as_deref(),
        )?;

        let now = Instant::now();
        let inserted = self.pending.insert(AuthorizationRequest {
            state: state.clone(),
            provider: cfg.name.clone(),
            scopes: cfg.scopes.clone(),
            target: safe_target(target),
            pkce_verifier,
            nonce,
            redirect_uri,
            created_at: now,
            expires_at: now + self.pending.ttl(),
        });
        match inserted {
            Ok(dropped) => self.record_expired(&dropped),
            Err(StoreFull) => {
                tracing::warn!(
                    provider = %cfg.name,
                    capacity = self.pending.capacity(),
                    "pending login limit reached"
                );
                return Err(Error::TooManyPending);
            }
        }

        tracing::debug!(provider = %cfg.name, target, "login started");
        Ok(RedirectInstruction { location, state })
    }

    /// Redeem a callback. Always logs exactly one outcome record.
    ///
    /// `browser_state` is the state the caller bound to the browser when the
    /// login began. It must equal the callback's `state`.
    pub async fn handle_callback(
        &self,
        provider_name: &str,
        params: CallbackParams,
        browser_state: Option<&str>,
    ) -> ValidationOutcome {
        let outcome = match self.complete(provider_name, params, browser_state).await {
            Ok(outcome) => outcome,
            Err(failure) => ValidationOutcome::Failure(failure),
        };
        self.logger.record(provider_name, &outcome);
        outcome
    }

    async fn complete(
        &self,
        provider_name: &str,
        params: CallbackParams,
        browser_state: Option<&str>,
    ) -> std::result::Result<ValidationOutcome, Failure> {
        let state = params
            .state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Failure::invalid_state("callback has no state parameter"))?;

        // Checked before the take so a foreign callback cannot burn the flow
        let bound = browser_state
            .is_some_and(|b| bool::from(b.as_bytes().ct_eq(state.as_bytes())));
        if !bound {
            return Err(Failure::invalid_state(
                "state is not bound to this browser",
            ));
        }

        let request = self.pending.take(&state).map_err(|e| match e {
            TakeError::Unknown => Failure::invalid_state("state is not pending (unknown or already used)"),
            TakeError::Expired => Failure::invalid_state("authorization request expired"),
        })?;

        if request.provider != provider_name {
            return Err(Failure::invalid_state(format!(
                "state was issued for provider '{}'",
                request.provider
            )));
        }

        if let Some(error) = params.error.filter(|e| !e.is_empty()) {
            let detail = match params.error_description {
                Some(desc) => format!("provider redirected with error={error}: {desc}"),
                None => format!("provider redirected with error={error}"),
            };
            return Err(Failure::new(FailureKind::RedirectError { error }, detail));
        }

        let code = params.code.filter(|c| !c.is_empty()).ok_or_else(|| {
            Failure::new(
                FailureKind::MissingParameter("code"),
                "callback has no code parameter",
            )
        })?;

        let provider = self.providers.get(&request.provider).ok_or_else(|| {
            Failure::invalid_state(format!("provider '{}' no longer configured", request.provider))
        })?;

        let tokens = self
            .exchanger
            .exchange(&provider, &code, &request.redirect_uri, &request.pkce_verifier)
            .await?;

        let claims = match provider.style() {
            ProviderStyle::Oidc => {
                let id_token = tokens.id_token.as_deref().ok_or_else(|| {
                    Failure::bad_token(TokenCheck::MissingClaim, "token response has no id_token")
                })?;
                self.oidc_claims(&provider, &request, id_token, &tokens.access_token)
                    .await?
            }
            ProviderStyle::OAuth => fetch_userinfo(&provider, &tokens.access_token).await?,
        };

        let profile = parse_profile(&claims, &provider.config.profile_mapping)?;
        Ok(ValidationOutcome::Success {
            provider: request.provider,
            principal: profile.provider_id,
            claims,
            target: request.target,
        })
    }

    /// Verify the ID token, then fill in the principal claim from userinfo
    /// when the token does not carry it.
    async fn oidc_claims(
        &self,
        provider: &Provider,
        request: &AuthorizationRequest,
        id_token: &str,
        access_token: &str,
    ) -> std::result::Result<Claims, Failure> {
        let cfg = &provider.config;
        let (Some(jwks_uri), Some(issuer)) = (cfg.jwks_uri.as_deref(), cfg.issuer.as_deref()) else {
            return Err(Failure::new(
                FailureKind::JwksUnreachable,
                "provider has no jwks_uri or issuer",
            ));
        };
        let expect = Expectation {
            jwks_uri,
            issuer,
            audience: &cfg.client_id,
            nonce: request.nonce.as_deref(),
        };
        let mut claims = self
            .validator
            .validate(id_token, &provider.transport, &expect)
            .await?;

        let mapped = &cfg.profile_mapping.provider_id;
        if !claims.contains_key(mapped) && cfg.userinfo_url.is_some() {
            let extra = fetch_userinfo(provider, access_token).await?;
            if extra.get("sub") != claims.get("sub") {
                return Err(Failure::new(
                    FailureKind::UserInfoError,
                    "userinfo sub does not match ID token sub",
                ));
            }
            for (k, v) in extra {
                claims.entry(k).or_insert(v);
            }
        }
        Ok(claims)
    }

    /// Drop expired pending requests, logging one record per flow.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.pending.sweep(Instant::now());
        self.record_expired(&expired);
        expired.len()
    }

    fn record_expired(&self, expired: &[AuthorizationRequest]) {
        for request in expired {
            self.logger.record_expired(
                &request.provider,
                &Failure::invalid_state("authorization request expired before callback"),
            );
        }
    }
}

/// Only same-origin paths are accepted as post-login targets. The result is
/// always a valid `Location` header value.
pub fn safe_target(target: &str) -> String {
    let ok = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && target.bytes().all(|b| b.is_ascii_graphic());
    if ok { target.to_string() } else { "/".to_string() }
}
