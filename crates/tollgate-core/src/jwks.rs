//! ID-token verification against a provider's published key set.
//!
//! Key sets are cached per JWKS URI for a short TTL. A token whose `kid` is
//! not in the cached set triggers at most one refresh, and concurrent
//! refreshes of the same URI share a single fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::outcome::{Claims, Failure, FailureKind, TokenCheck};
use crate::transport::TransportClient;

/// What an ID token must match.
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    pub jwks_uri: &'a str,
    pub issuer: &'a str,
    pub audience: &'a str,
    pub nonce: Option<&'a str>,
}

struct CachedSet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
    generation: u64,
}

/// A key set handed out by [`JwksCache`].
#[derive(Debug, Clone)]
pub struct CachedKeys {
    pub keys: Arc<JwkSet>,
    pub generation: u64,
    /// Fetched from the provider by this call rather than served from cache.
    pub fetched: bool,
}

/// Raw set with per-key parsing, so one unsupported key does not hide the rest.
#[derive(Deserialize)]
struct RawJwkSet {
    keys: Vec<serde_json::Value>,
}

pub struct JwksCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedSet>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn fresh(&self, uri: &str) -> Option<CachedKeys> {
        let entries = self.entries.read().await;
        entries
            .get(uri)
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.cached())
    }

    /// Cached set if fresh, otherwise fetched.
    pub async fn get(
        &self,
        uri: &str,
        transport: &TransportClient,
    ) -> Result<CachedKeys, Failure> {
        if let Some(hit) = self.fresh(uri).await {
            return Ok(hit);
        }
        self.refresh(uri, transport, None).await
    }

    /// Fetch `uri` unless another caller already replaced `stale_generation`
    /// (or, with no generation, already holds a fresh set) while we waited.
    pub async fn refresh(
        &self,
        uri: &str,
        transport: &TransportClient,
        stale_generation: Option<u64>,
    ) -> Result<CachedKeys, Failure> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(uri.to_string()).or_default().clone()
        };
        let _guard = lock.lock().await;

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(uri) {
                let superseded = match stale_generation {
                    Some(seen) => entry.generation > seen,
                    None => entry.fetched_at.elapsed() < self.ttl,
                };
                if superseded {
                    return Ok(entry.cached());
                }
            }
        }

        let keys = Arc::new(fetch_jwks(uri, transport).await?);
        let mut entries = self.entries.write().await;
        let generation = entries.get(uri).map_or(1, |e| e.generation + 1);
        entries.insert(
            uri.to_string(),
            CachedSet {
                keys: keys.clone(),
                fetched_at: Instant::now(),
                generation,
            },
        );
        tracing::debug!(jwks_uri = uri, generation, keys = keys.keys.len(), "JWKS refreshed");
        Ok(CachedKeys {
            keys,
            generation,
            fetched: true,
        })
    }
}

impl CachedSet {
    fn cached(&self) -> CachedKeys {
        CachedKeys {
            keys: self.keys.clone(),
            generation: self.generation,
            fetched: false,
        }
    }
}

async fn fetch_jwks(uri: &str, transport: &TransportClient) -> Result<JwkSet, Failure> {
    let unreachable = |detail: String| Failure::new(FailureKind::JwksUnreachable, detail);

    let response = transport
        .send(transport.http().get(uri), None)
        .await
        .map_err(|e| unreachable(format!("{uri}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(unreachable(format!("{uri}: HTTP {status}")));
    }
    let raw: RawJwkSet = response
        .json()
        .await
        .map_err(|e| unreachable(format!("{uri}: invalid key set: {e}")))?;

    let keys = raw
        .keys
        .into_iter()
        .filter_map(|k| match serde_json::from_value::<Jwk>(k) {
            Ok(jwk) => Some(jwk),
            Err(e) => {
                tracing::debug!(jwks_uri = uri, error = %e, "skipping unsupported JWK");
                None
            }
        })
        .collect();
    Ok(JwkSet { keys })
}

pub struct JwksValidator {
    cache: Arc<JwksCache>,
    leeway_secs: u64,
}

impl JwksValidator {
    pub fn new(cache: Arc<JwksCache>, leeway_secs: u64) -> Self {
        Self { cache, leeway_secs }
    }

    pub fn cache(&self) -> &Arc<JwksCache> {
        &self.cache
    }

    /// Verify signature, `iss`, `aud`, `exp`, `nbf` and `nonce`. Returns the
    /// token's claims.
    pub async fn validate(
        &self,
        id_token: &str,
        transport: &TransportClient,
        expect: &Expectation<'_>,
    ) -> Result<Claims, Failure> {
        let header = decode_header(id_token)
            .map_err(|e| Failure::bad_token(TokenCheck::Malformed, e.to_string()))?;
        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(Failure::bad_token(
                TokenCheck::Algorithm,
                format!("symmetric algorithm {:?} not accepted", header.alg),
            ));
        }

        let unknown_key = || {
            Failure::bad_token(
                TokenCheck::UnknownKey,
                format!("no key with kid {:?} at {}", header.kid, expect.jwks_uri),
            )
        };
        let cached = self.cache.get(expect.jwks_uri, transport).await?;
        let jwk = match select_key(&cached.keys, header.kid.as_deref()) {
            Some(jwk) => jwk,
            // A set fetched just now would come back the same
            None if cached.fetched => return Err(unknown_key()),
            None => {
                let refreshed = self
                    .cache
                    .refresh(expect.jwks_uri, transport, Some(cached.generation))
                    .await?;
                select_key(&refreshed.keys, header.kid.as_deref()).ok_or_else(unknown_key)?
            }
        };

        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            return Err(Failure::bad_token(
                TokenCheck::Algorithm,
                "symmetric keys are not accepted",
            ));
        }
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| Failure::bad_token(TokenCheck::UnknownKey, e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[expect.issuer]);
        validation.set_audience(&[expect.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<Claims>(id_token, &key, &validation).map_err(|e| {
            let check = check_for(e.kind());
            Failure::bad_token(check, format!("{check} check failed: {e}"))
        })?;

        if let Some(expected) = expect.nonce {
            match data.claims.get("nonce").and_then(|v| v.as_str()) {
                Some(actual) if actual == expected => {}
                Some(_) => return Err(Failure::bad_token(TokenCheck::Nonce, "nonce mismatch")),
                None => return Err(Failure::bad_token(TokenCheck::Nonce, "nonce missing")),
            }
        }

        Ok(data.claims)
    }
}

/// By `kid`, or the only key when the token names none.
fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => keys.find(kid).cloned(),
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

fn check_for(kind: &jsonwebtoken::errors::ErrorKind) -> TokenCheck {
    use jsonwebtoken::errors::ErrorKind;
    match kind {
        ErrorKind::InvalidSignature => TokenCheck::Signature,
        ErrorKind::ExpiredSignature => TokenCheck::Expired,
        ErrorKind::ImmatureSignature => TokenCheck::NotYetValid,
        ErrorKind::InvalidIssuer => TokenCheck::Issuer,
        ErrorKind::InvalidAudience => TokenCheck::Audience,
        ErrorKind::MissingRequiredClaim(_) => TokenCheck::MissingClaim,
        ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm | ErrorKind::InvalidAlgorithmName => {
            TokenCheck::Algorithm
        }
        ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => {
            TokenCheck::UnknownKey
        }
        _ => TokenCheck::Malformed,
    }
}
