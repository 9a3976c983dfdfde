//! Login outcomes, failure taxonomy, and the one-record-per-outcome logger.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use serde::Serialize;

use crate::error::Error;

/// Stable log identifiers, one per terminal outcome type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageId {
    LoginSucceeded,
    InvalidState,
    HandshakeFailure,
    UnableToContactProvider,
    ProxyUnreachable,
    ProviderTimeout,
    AuthCodeError,
    BadToken,
    JwksUnreachable,
    RedirectContainedError,
    MissingParameter,
    UserinfoError,
    MissingClaims,
}

impl MessageId {
    pub const ALL: [MessageId; 13] = [
        Self::LoginSucceeded,
        Self::InvalidState,
        Self::HandshakeFailure,
        Self::UnableToContactProvider,
        Self::ProxyUnreachable,
        Self::ProviderTimeout,
        Self::AuthCodeError,
        Self::BadToken,
        Self::JwksUnreachable,
        Self::RedirectContainedError,
        Self::MissingParameter,
        Self::UserinfoError,
        Self::MissingClaims,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSucceeded => "LOGIN_SUCCEEDED",
            Self::InvalidState => "INVALID_STATE",
            Self::HandshakeFailure => "HANDSHAKE_FAILURE",
            Self::UnableToContactProvider => "UNABLE_TO_CONTACT_PROVIDER",
            Self::ProxyUnreachable => "PROXY_UNREACHABLE",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::AuthCodeError => "AUTH_CODE_ERROR",
            Self::BadToken => "BAD_TOKEN",
            Self::JwksUnreachable => "JWKS_UNREACHABLE",
            Self::RedirectContainedError => "REDIRECT_CONTAINED_ERROR",
            Self::MissingParameter => "MISSING_PARAMETER",
            Self::UserinfoError => "USERINFO_ERROR",
            Self::MissingClaims => "MISSING_CLAIMS",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown message id: {s}")))
    }
}

/// Which network-level problem stopped an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Connect,
    ProxyUnreachable,
    Timeout,
    Other,
}

/// The ID-token check that rejected a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Malformed,
    Algorithm,
    UnknownKey,
    Signature,
    Issuer,
    Audience,
    Expired,
    NotYetValid,
    Nonce,
    MissingClaim,
}

impl TokenCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Algorithm => "algorithm",
            Self::UnknownKey => "unknown_key",
            Self::Signature => "signature",
            Self::Issuer => "issuer",
            Self::Audience => "audience",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::Nonce => "nonce",
            Self::MissingClaim => "missing_claim",
        }
    }
}

impl fmt::Display for TokenCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidState,
    HandshakeFailure,
    Transport(TransportKind),
    AuthCodeError { status: Option<u16> },
    BadToken(TokenCheck),
    JwksUnreachable,
    RedirectError { error: String },
    MissingParameter(&'static str),
    UserInfoError,
    MissingClaims(String),
}

impl FailureKind {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::InvalidState => MessageId::InvalidState,
            Self::HandshakeFailure => MessageId::HandshakeFailure,
            Self::Transport(TransportKind::ProxyUnreachable) => MessageId::ProxyUnreachable,
            Self::Transport(TransportKind::Timeout) => MessageId::ProviderTimeout,
            Self::Transport(TransportKind::Connect | TransportKind::Other) => {
                MessageId::UnableToContactProvider
            }
            Self::AuthCodeError { .. } => MessageId::AuthCodeError,
            Self::BadToken(_) => MessageId::BadToken,
            Self::JwksUnreachable => MessageId::JwksUnreachable,
            Self::RedirectError { .. } => MessageId::RedirectContainedError,
            Self::MissingParameter(_) => MessageId::MissingParameter,
            Self::UserInfoError => MessageId::UserinfoError,
            Self::MissingClaims(_) => MessageId::MissingClaims,
        }
    }
}

/// A typed login failure. `detail` is for the server log only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidState, detail)
    }

    pub fn bad_token(check: TokenCheck, detail: impl Into<String>) -> Self {
        Self::new(FailureKind::BadToken(check), detail)
    }

    pub fn message_id(&self) -> MessageId {
        self.kind.message_id()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message_id(), self.detail)
    }
}

pub type Claims = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Success {
        provider: String,
        principal: String,
        claims: Claims,
        /// Where the browser goes after the session is established.
        target: String,
    },
    Failure(Failure),
}

impl ValidationOutcome {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Success { .. } => MessageId::LoginSucceeded,
            Self::Failure(f) => f.message_id(),
        }
    }

    /// Status the callback responds with: a redirect on success, 401 on any failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Success { .. } => StatusCode::FOUND,
            Self::Failure(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Writes exactly one record per terminal outcome.
///
/// While quiescing, failures listed in the expected set are downgraded from
/// `warn` to `info` and tagged `expected = true`.
#[derive(Debug, Default)]
pub struct OutcomeLogger {
    expected_during_quiesce: HashSet<MessageId>,
    quiescing: AtomicBool,
}

impl OutcomeLogger {
    pub fn new(expected_during_quiesce: impl IntoIterator<Item = MessageId>) -> Self {
        Self {
            expected_during_quiesce: expected_during_quiesce.into_iter().collect(),
            quiescing: AtomicBool::new(false),
        }
    }

    pub fn quiesce(&self) {
        self.quiescing.store(true, Ordering::SeqCst);
        tracing::info!("outcome logger quiescing");
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst)
    }

    fn is_expected(&self, id: MessageId) -> bool {
        self.is_quiescing() && self.expected_during_quiesce.contains(&id)
    }

    pub fn record(&self, provider: &str, outcome: &ValidationOutcome) {
        let message_id = outcome.message_id();
        let status = outcome.status().as_u16();
        metrics::counter!("tollgate_login_outcomes_total", "message_id" => message_id.as_str())
            .increment(1);

        match outcome {
            ValidationOutcome::Success { principal, .. } => {
                tracing::info!(
                    message_id = message_id.as_str(),
                    provider,
                    status,
                    principal = %principal,
                    "login succeeded"
                );
            }
            ValidationOutcome::Failure(failure) => self.record_failure(provider, failure, status),
        }
    }

    /// Log a failure that did not come from a callback (e.g. a swept flow).
    pub fn record_expired(&self, provider: &str, failure: &Failure) {
        let message_id = failure.message_id();
        metrics::counter!("tollgate_login_outcomes_total", "message_id" => message_id.as_str())
            .increment(1);
        self.record_failure(provider, failure, StatusCode::UNAUTHORIZED.as_u16());
    }

    fn record_failure(&self, provider: &str, failure: &Failure, status: u16) {
        let message_id = failure.message_id();
        if self.is_expected(message_id) {
            tracing::info!(
                message_id = message_id.as_str(),
                provider,
                status,
                detail = %failure.detail,
                expected = true,
                "login failed"
            );
        } else {
            tracing::warn!(
                message_id = message_id.as_str(),
                provider,
                status,
                detail = %failure.detail,
                "login failed"
            );
        }
    }
}
