use serde::Serialize;

use crate::config::ProfileMapping;
use crate::outcome::{Claims, Failure, FailureKind};
use crate::provider::Provider;

/// Identity extracted from ID-token claims or a userinfo response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub provider_id: String,
    pub email: Option<String>,
    /// Whether the provider verified the email address.
    pub email_verified: bool,
    pub name: Option<String>,
}

/// Fetch the user's claims from the provider's userinfo endpoint.
pub async fn fetch_userinfo(provider: &Provider, access_token: &str) -> Result<Claims, Failure> {
    let Some(url) = provider.config.userinfo_url.as_deref() else {
        return Err(Failure::new(
            FailureKind::UserInfoError,
            "provider has no userinfo endpoint",
        ));
    };

    let request = provider
        .transport
        .http()
        .get(url)
        .bearer_auth(access_token)
        .header("Accept", "application/json");
    let response = provider.transport.send(request, None).await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Failure::new(
            FailureKind::UserInfoError,
            format!("userinfo endpoint returned HTTP {status}"),
        ));
    }

    let body: serde_json::Value = response.json().await.map_err(|e| {
        Failure::new(
            FailureKind::UserInfoError,
            format!("userinfo response is not JSON: {e}"),
        )
    })?;

    match body {
        serde_json::Value::Object(claims) => Ok(claims),
        _ => Err(Failure::new(
            FailureKind::UserInfoError,
            "userinfo response is not a JSON object",
        )),
    }
}

/// Map claims to a profile. A missing principal claim is a `MissingClaims` failure.
pub fn parse_profile(claims: &Claims, mapping: &ProfileMapping) -> Result<Profile, Failure> {
    let id = claims.get(&mapping.provider_id);
    let provider_id = id
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .or_else(|| id.and_then(|v| v.as_u64()).map(|n| n.to_string()))
        .or_else(|| id.and_then(|v| v.as_i64()).map(|n| n.to_string()))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Failure::new(
                FailureKind::MissingClaims(mapping.provider_id.clone()),
                format!("claim '{}' missing from provider response", mapping.provider_id),
            )
        })?;

    let text = |field: &Option<String>| {
        field
            .as_deref()
            .filter(|f| !f.is_empty())
            .and_then(|f| claims.get(f))
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    let email_verified = mapping
        .email_verified
        .as_ref()
        .and_then(|f| claims.get(f))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(Profile {
        provider_id,
        email: text(&mapping.email),
        email_verified,
        name: text(&mapping.name),
    })
}
