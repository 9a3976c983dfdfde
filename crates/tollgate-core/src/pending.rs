use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One login attempt between redirect and callback.
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub state: String,
    pub provider: String,
    pub scopes: String,
    /// Protected resource the user was trying to reach.
    pub target: String,
    pub pkce_verifier: String,
    pub nonce: Option<String>,
    pub redirect_uri: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl AuthorizationRequest {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("provider", &self.provider)
            .field("target", &self.target)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Why a state could not be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// Never issued, already used, or swept.
    Unknown,
    Expired,
}

/// The store holds `capacity` live requests and none of them has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFull;

/// Pending requests keyed by state token.
///
/// Every operation holds the lock for its whole duration, so a callback and
/// the expiry sweep can never both observe the same request.
pub struct PendingStore {
    ttl: Duration,
    capacity: usize,
    requests: Mutex<HashMap<String, AuthorizationRequest>>,
}

impl PendingStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AuthorizationRequest>> {
        // Entries are plain data; a poisoned map is still consistent
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `request`. A full store first drops its expired entries and
    /// returns them so the caller can account for them.
    pub fn insert(&self, request: AuthorizationRequest) -> Result<Vec<AuthorizationRequest>, StoreFull> {
        let mut requests = self.lock();
        let mut dropped = Vec::new();
        if requests.len() >= self.capacity {
            dropped = drain_expired(&mut requests, Instant::now());
            if requests.len() >= self.capacity {
                return Err(StoreFull);
            }
        }
        requests.insert(request.state.clone(), request);
        Ok(dropped)
    }

    /// Remove and return the request for `state`. The entry is gone on every
    /// path, including when it has expired.
    pub fn take(&self, state: &str) -> Result<AuthorizationRequest, TakeError> {
        let request = self.lock().remove(state).ok_or(TakeError::Unknown)?;
        if request.is_expired(Instant::now()) {
            return Err(TakeError::Expired);
        }
        Ok(request)
    }

    /// Remove every expired request and return them.
    pub fn sweep(&self, now: Instant) -> Vec<AuthorizationRequest> {
        drain_expired(&mut self.lock(), now)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn drain_expired(
    requests: &mut HashMap<String, AuthorizationRequest>,
    now: Instant,
) -> Vec<AuthorizationRequest> {
    let expired: Vec<String> = requests
        .iter()
        .filter(|(_, r)| r.is_expired(now))
        .map(|(state, _)| state.clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|state| requests.remove(&state))
        .collect()
}
