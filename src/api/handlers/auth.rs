//! Interactive login and logout endpoints.

use crate::{
    api::{
        handlers::{auth_request, respond},
        AppState, FLASH_KEY,
    },
    auth::{static_broker::escape_html, LOGIN_PATH},
    session::Session,
};
use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

#[utoipa::path(
    get,
    path= "/auth/login",
    params(
        ("redirecturl" = Option<String>, Query, description = "Same-origin URL to return to after login")
    ),
    responses (
        (status = 302, description = "Redirect to the identity provider"),
        (status = 401, description = "HTTP Basic challenge"),
        (status = 404, description = "No interactive broker registered")
    ),
    tag = "auth",
)]
/// Start a login with the first interactive broker.
#[instrument(skip_all)]
pub async fn login(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.authenticate(&request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/login/{broker}",
    params(
        ("broker" = String, Path, description = "Registered broker name"),
        ("redirecturl" = Option<String>, Query, description = "Same-origin URL to return to after login")
    ),
    responses (
        (status = 200, description = "Broker login page", content_type = "text/html"),
        (status = 302, description = "Redirect to the identity provider"),
        (status = 401, description = "HTTP Basic challenge"),
        (status = 404, description = "Unknown broker or no interactive login")
    ),
    tag = "auth",
)]
/// Start a login with the named broker.
#[instrument(skip_all, fields(broker = %broker))]
pub async fn login_broker(
    Path(broker): Path<String>,
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.authenticate_for(&broker, &request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/callback/{broker}",
    params(
        ("broker" = String, Path, description = "Registered broker name"),
        ("state" = Option<String>, Query, description = "State token issued at login"),
        ("code" = Option<String>, Query, description = "Authorization code"),
        ("error" = Option<String>, Query, description = "Error reported by the identity provider")
    ),
    responses (
        (status = 302, description = "Login finished, or redirect to /auth/failed"),
        (status = 404, description = "Unknown broker or no callback support")
    ),
    tag = "auth",
)]
/// Finish a login started by the named broker.
#[instrument(skip_all, fields(broker = %broker))]
pub async fn callback(
    Path(broker): Path<String>,
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.callback_for(&broker, &request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/logout",
    params(
        ("redirecturl" = Option<String>, Query, description = "Same-origin URL to return to after logout")
    ),
    responses (
        (status = 302, description = "Logged out of every broker")
    ),
    tag = "auth",
)]
/// Log out of every broker.
#[instrument(skip_all)]
pub async fn logout(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.logout(&request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/logout/{broker}",
    params(
        ("broker" = String, Path, description = "Registered broker name"),
        ("redirecturl" = Option<String>, Query, description = "Same-origin URL to return to after logout")
    ),
    responses (
        (status = 302, description = "Logged out of the broker"),
        (status = 404, description = "Unknown broker or no logout support")
    ),
    tag = "auth",
)]
/// Log out of the named broker only.
#[instrument(skip_all, fields(broker = %broker))]
pub async fn logout_broker(
    Path(broker): Path<String>,
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.logout_for(&broker, &request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/logout-callback",
    responses (
        (status = 302, description = "Next external logout URL, or the post-logout target")
    ),
    tag = "auth",
)]
/// Walk the pending external logout redirects.
#[instrument(skip_all)]
pub async fn logout_callback(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = auth_request(&state, session, query, headers);
    let result = state.registry.logout_callback(&request).await;
    respond(&request, result).await
}

#[utoipa::path(
    get,
    path= "/auth/failed",
    responses (
        (status = 200, description = "Login failure page with a retry link", content_type = "text/html")
    ),
    tag = "auth",
)]
/// Show the last login failure once and offer to retry.
pub async fn failed(Extension(session): Extension<Arc<Session>>) -> impl IntoResponse {
    let message = session
        .remove(FLASH_KEY)
        .await
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "Login failed.".to_string());

    Html(format!(
        "<!DOCTYPE html>\n<html><head><title>Login failed</title></head><body>\n\
         <h1>Login failed</h1>\n<p>{}</p>\n<p><a href=\"{LOGIN_PATH}\">Try again</a></p>\n\
         </body></html>\n",
        escape_html(&message)
    ))
}
