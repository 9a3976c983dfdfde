use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::CookieJar;

use tollgate_core::config::ResourceEntry;
use tollgate_core::error::Error;

use super::found;
use super::login::build_state_cookie;
use crate::server::AppState;

const DEFAULT_BODY: &str = "Hello World!";

/// One GET route per protected resource.
pub fn router(resources: &[ResourceEntry]) -> Router<AppState> {
    resources.iter().fold(Router::new(), |router, entry| {
        let resource = Arc::new(entry.clone());
        router.route(
            &entry.path,
            get(move |state: State<AppState>, jar: CookieJar| {
                let resource = resource.clone();
                async move { protected_resource(state, jar, resource).await }
            }),
        )
    })
}

/// Serve the body to a holder of a session for the resource's provider,
/// otherwise start a login with that provider.
async fn protected_resource(
    State(state): State<AppState>,
    jar: CookieJar,
    resource: Arc<ResourceEntry>,
) -> Result<Response, Error> {
    let session = jar
        .get(&state.cookie_names.session)
        .and_then(|c| state.sessions.verify(c.value()).ok());

    match session {
        Some(claims) if claims.provider == resource.provider => {
            tracing::debug!(path = %resource.path, principal = %claims.sub, "serving protected resource");
            let body = resource.body.as_deref().unwrap_or(DEFAULT_BODY).to_string();
            Ok(body.into_response())
        }
        _ => {
            let instruction = state.flow.begin_login(&resource.path, &resource.provider).await?;
            let jar = jar.add(build_state_cookie(&state, &instruction.state));
            Ok((jar, found(&instruction.location)).into_response())
        }
    }
}
