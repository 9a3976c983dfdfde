use std::fmt;

use serde::Deserialize;

use crate::config::TokenAuthMethod;
use crate::outcome::{Failure, FailureKind};
use crate::provider::Provider;

/// Provider error payloads are cut to this many bytes before logging.
pub const MAX_ERROR_PAYLOAD: usize = 2048;

#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"***")
            .field("id_token", &self.id_token.as_ref().map(|_| "***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Redeems authorization codes at a provider's token endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenExchanger;

impl TokenExchanger {
    pub fn new() -> Self {
        Self
    }

    pub async fn exchange(
        &self,
        provider: &Provider,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<TokenResponse, Failure> {
        let cfg = &provider.config;
        if cfg.client_id.is_empty() {
            return Err(Failure::new(
                FailureKind::MissingParameter("client_id"),
                "client_id is empty",
            ));
        }
        if cfg.client_secret.is_empty() {
            return Err(Failure::new(
                FailureKind::MissingParameter("client_secret"),
                "client_secret is empty",
            ));
        }

        let mut params = vec![
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", pkce_verifier),
        ];
        if cfg.token_auth_method == TokenAuthMethod::ClientSecretPost {
            params.push(("client_id", cfg.client_id.as_str()));
            params.push(("client_secret", cfg.client_secret.as_str()));
        }
        if cfg.send_grant_type {
            params.push(("grant_type", "authorization_code"));
        }

        let mut request = provider.transport.http().post(&cfg.token_url).form(&params);
        if cfg.token_auth_method == TokenAuthMethod::ClientSecretBasic {
            // Credentials are form-encoded before going into the header
            request = request.basic_auth(
                form_encode(&cfg.client_id),
                Some(form_encode(&cfg.client_secret)),
            );
        }
        if cfg.token_request_accept_json {
            request = request.header("Accept", "application/json");
        }

        tracing::debug!(provider = %cfg.name, token_url = %cfg.token_url, "exchanging authorization code");
        let response = provider.transport.send(request, None).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Failure::from(provider.transport.classify(&e)))?;

        if !status.is_success() {
            return Err(Failure::new(
                FailureKind::AuthCodeError {
                    status: Some(status.as_u16()),
                },
                format!(
                    "token endpoint returned HTTP {status}: {}",
                    sanitize_payload(&body, &cfg.client_secret)
                ),
            ));
        }

        parse_token_response(&body).ok_or_else(|| {
            Failure::new(
                FailureKind::AuthCodeError {
                    status: Some(status.as_u16()),
                },
                format!(
                    "token response has no access_token: {}",
                    sanitize_payload(&body, &cfg.client_secret)
                ),
            )
        })
    }
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// JSON first; some providers answer form-encoded unless asked otherwise.
fn parse_token_response(body: &str) -> Option<TokenResponse> {
    if let Ok(parsed) = serde_json::from_str::<TokenResponse>(body) {
        return Some(parsed).filter(|t| !t.access_token.is_empty());
    }
    if body.trim_start().starts_with('{') {
        return None;
    }
    let mut response = TokenResponse {
        access_token: String::new(),
        id_token: None,
        refresh_token: None,
        expires_in: None,
        token_type: None,
        scope: None,
    };
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "access_token" => response.access_token = value,
            "id_token" => response.id_token = Some(value),
            "refresh_token" => response.refresh_token = Some(value),
            "expires_in" => response.expires_in = value.parse().ok(),
            "token_type" => response.token_type = Some(value),
            "scope" => response.scope = Some(value),
            _ => {}
        }
    }
    Some(response).filter(|t| !t.access_token.is_empty())
}

/// Truncate to [`MAX_ERROR_PAYLOAD`] bytes and mask the client secret.
pub fn sanitize_payload(body: &str, client_secret: &str) -> String {
    let masked = if client_secret.is_empty() {
        body.to_string()
    } else {
        body.replace(client_secret, "***")
    };
    if masked.len() <= MAX_ERROR_PAYLOAD {
        return masked;
    }
    let mut end = MAX_ERROR_PAYLOAD;
    while !masked.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &masked[..end])
}
