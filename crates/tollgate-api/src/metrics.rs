use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, histogram};

use subtle::ConstantTimeEq;

use crate::server::AppState;

/// Axum middleware that records HTTP request metrics.
///
/// Records:
/// - `tollgate_http_requests_total` counter with `method`, `path`, `status` labels
/// - `tollgate_http_request_duration_seconds` histogram with `method`, `path` labels
pub async fn http_metrics_middleware(
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    counter!("tollgate_http_requests_total",
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status,
    )
    .increment(1);

    histogram!("tollgate_http_request_duration_seconds",
        "method" => method,
        "path" => path,
    )
    .record(duration);

    response
}

/// Normalize request paths to keep label cardinality bounded.
///
/// The provider segment of `/login/...` is replaced with `:provider`, since
/// anyone can request a login for an arbitrary name. Other segments that look
/// like ids become `:id`, and anything deeper than four segments collapses to
/// `/unknown`.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() > 5 {
        return "/unknown".to_string();
    }
    let is_login = segments.get(1) == Some(&"login");
    let normalized: Vec<&str> = segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if is_login && i == 2 && !s.is_empty() {
                ":provider"
            } else if looks_like_id(s) {
                ":id"
            } else {
                s
            }
        })
        .collect();
    normalized.join("/")
}

/// Check if a path segment looks like an ID (numeric or long hex string).
fn looks_like_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.chars().all(|c| c.is_ascii_digit()) && s.len() > 3 {
        return true;
    }
    s.len() >= 16 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Handler for the /metrics endpoint. Returns Prometheus text format.
pub async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(handle) = state.metrics_handle.as_ref() else {
        return (StatusCode::NOT_FOUND, "metrics not enabled").into_response();
    };

    if let Some(ref token_config) = state.config.metrics.bearer_token {
        let expected = match token_config.resolve() {
            Ok(t) => t,
            Err(_) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "metrics token config error")
                    .into_response();
            }
        };

        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(token)
                if token.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1 => {}
            _ => {
                return (StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
                    .into_response();
            }
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
        .into_response()
}
