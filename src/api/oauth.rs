//! OAuth start and callback endpoints.

use super::{AppError, AppState};
use crate::oauth::CallbackParams;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use std::sync::Arc;
use tracing::{debug, info};

/// Cookie carrying the PKCE session id between start and callback.
pub const SESSION_COOKIE: &str = "issue_sync_oauth_session";

/// GET /api/connectors/:provider/oauth/start
///
/// Parks a fresh PKCE session server-side and redirects the browser to the
/// provider's consent page.
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AppError> {
    let flow = state.flow(&provider)?;
    let request = flow.start();
    let session_id = state.sessions.insert(request.session);

    debug!(provider = %provider, "PKCE session stored");

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/api/connectors")
        .max_age(time::Duration::seconds(state.session_ttl_seconds));

    Ok((jar.add(cookie), Redirect::temporary(&request.url)))
}

/// GET /api/connectors/:provider/oauth/callback
///
/// Consumes the PKCE session named by the cookie, completes the flow and
/// sends the browser back to the frontend. Failures answer with a JSON error.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), AppError> {
    let flow = state.flow(&provider)?;

    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.take(cookie.value()));
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/api/connectors"));

    let record = match flow.complete(&state.user_id, session, &params).await {
        Ok(record) => record,
        Err(e) => return Ok((jar, AppError::from(e).into_response())),
    };

    info!(
        provider = %provider,
        site = %record.site_name,
        "Integration connected"
    );

    let target = format!(
        "{}/?{}_connected=true",
        state.frontend_url.trim_end_matches('/'),
        provider
    );
    Ok((jar, Redirect::temporary(&target).into_response()))
}
