use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Config
    #[error("config not found (searched: {searched:?})")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("config parse error in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    // Startup / outbound plumbing
    #[error("trust store error: {0}")]
    Trust(String),

    #[error("http client error: {0}")]
    HttpClient(String),

    // Request handling
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Login failed or session missing. The reason is logged server side only.
    #[error("unauthorized")]
    Unauthorized,

    #[error("too many logins in progress")]
    TooManyPending,

    #[error("invalid session")]
    InvalidToken,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::Config(_)
            | Self::Trust(_)
            | Self::HttpClient(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,

            Self::TooManyPending => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::UnknownProvider(_) | Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// User-facing error code (short, stable string).
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "config_not_found",
            Self::ConfigParse { .. } => "config_parse_error",
            Self::Config(_) => "config_error",
            Self::Trust(_) | Self::HttpClient(_) | Self::Internal(_) => {
                "internal_error"
            }
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Unauthorized => "unauthorized",
            Self::TooManyPending => "too_many_pending_logins",
            Self::InvalidToken => "invalid_token",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Server errors and login failures carry no detail to the client.
        // Both of the matched variants are logged where they arise.
        let detail = if matches!(self, Self::Unauthorized | Self::TooManyPending) {
            None
        } else if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            None
        } else {
            Some(self.to_string())
        };

        let body = ErrorBody {
            error: self.error_code().to_string(),
            detail,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
