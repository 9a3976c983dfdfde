use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use tollgate_core::error::Error;
use tollgate_core::flow::CallbackParams;
use tollgate_core::outcome::ValidationOutcome;

use super::found;
use crate::server::AppState;

const STATE_COOKIE_PATH: &str = "/login";

#[derive(Deserialize)]
pub struct LoginQuery {
    target: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login/{provider}", get(login_redirect))
        .route("/login/{provider}/callback", get(login_callback))
}

/// GET /login/{provider}?target=/path: redirect to the provider
async fn login_redirect(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(query): Query<LoginQuery>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), Error> {
    let target = query.target.as_deref().unwrap_or("/");
    let instruction = state.flow.begin_login(target, &provider_name).await?;
    let jar = jar.add(build_state_cookie(&state, &instruction.state));
    Ok((jar, found(&instruction.location)))
}

/// GET /login/{provider}/callback: finish the flow
///
/// Every failure gets the same 401 body; the reason is only in the log.
async fn login_callback(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    query: Result<Query<CallbackParams>, QueryRejection>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), Error> {
    // A garbled query still counts as a callback and gets its log record
    let params = query.map(|Query(p)| p).unwrap_or_default();
    let browser_state = jar.get(&state.cookie_names.state).map(|c| c.value().to_string());
    let jar = jar.remove(Cookie::build(state.cookie_names.state.clone()).path(STATE_COOKIE_PATH));

    match state
        .flow
        .handle_callback(&provider_name, params, browser_state.as_deref())
        .await
    {
        ValidationOutcome::Success {
            provider,
            principal,
            target,
            ..
        } => {
            let token = state.sessions.sign(&principal, &provider)?;
            let jar = jar.add(build_session_cookie(&state, token));
            Ok((jar, found(&target)))
        }
        ValidationOutcome::Failure(_) => Ok((jar, Error::Unauthorized.into_response())),
    }
}

/// Short-lived cookie carrying the state of the login this browser started.
pub(crate) fn build_state_cookie(state: &AppState, value: &str) -> Cookie<'static> {
    let mut cookie = Cookie::new(state.cookie_names.state.clone(), value.to_string());
    cookie.set_http_only(true);
    cookie.set_secure(state.config.server.secure_cookies);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path(STATE_COOKIE_PATH);
    cookie.set_max_age(cookie::time::Duration::seconds(
        state.flow.pending().ttl().as_secs() as i64,
    ));
    cookie
}

fn build_session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(state.cookie_names.session.clone(), token);
    cookie.set_http_only(true);
    cookie.set_secure(state.config.server.secure_cookies);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_max_age(cookie::time::Duration::seconds(
        state.sessions.ttl_secs() as i64,
    ));
    cookie
}
