pub mod auth;
pub mod health;
pub mod identities;

// common functions for the handlers
use crate::{
    api::{AppState, FLASH_KEY},
    auth::{AuthError, AuthRequest, BrokerResponse, RequestContext, FAILED_PATH},
    session::Session,
};
use axum::{
    http::{
        header::{LOCATION, WWW_AUTHENTICATE},
        HeaderMap, StatusCode,
    },
    response::{Html, IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Bind the HTTP request to an `AuthRequest` cancelled on server shutdown.
pub(crate) fn auth_request(
    state: &AppState,
    session: Arc<Session>,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> AuthRequest {
    AuthRequest::new(session, state.base_url.clone())
        .with_context(RequestContext::new(state.shutdown.child_token()))
        .with_query(query)
        .with_headers(headers)
}

pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

pub(crate) async fn respond(
    request: &AuthRequest,
    result: Result<BrokerResponse, AuthError>,
) -> Response {
    match result {
        Ok(BrokerResponse::Redirect(location)) => found(&location),
        Ok(BrokerResponse::Challenge { realm }) => (
            StatusCode::UNAUTHORIZED,
            [(
                WWW_AUTHENTICATE,
                format!("Basic realm=\"{realm}\", charset=\"UTF-8\""),
            )],
            "Unauthorized",
        )
            .into_response(),
        Ok(BrokerResponse::Page(html)) => Html(html).into_response(),
        Err(err) => error_response(request, err).await,
    }
}

async fn error_response(request: &AuthRequest, err: AuthError) -> Response {
    if err.is_login_failure() {
        debug!("login failed: {err}");
        if let Err(err) = request.session().insert(FLASH_KEY, &err.to_string()).await {
            error!("failed to store flash message: {err}");
        }
        return found(FAILED_PATH);
    }

    match err {
        AuthError::BrokerNotFound(_) | AuthError::Unsupported { .. } => {
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        AuthError::NotIdentified => (StatusCode::UNAUTHORIZED, err.to_string()).into_response(),
        err => {
            error!("request failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}
