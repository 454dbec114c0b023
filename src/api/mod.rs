#![allow(clippy::needless_for_each)]

use crate::{
    api::handlers::{
        auth, auth::__path_callback, auth::__path_failed, auth::__path_login,
        auth::__path_login_broker, auth::__path_logout, auth::__path_logout_broker,
        auth::__path_logout_callback, health, health::__path_health, identities,
        identities::__path_identities,
    },
    auth::Registry,
    cli::telemetry,
    session::{MemorySessionStore, Session},
};
use anyhow::Result;
use axum::{
    body::Body,
    extract::{MatchedPath, Request},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub(crate) mod handlers;

pub const SESSION_COOKIE: &str = "authbroker_session";
pub const FLASH_KEY: &str = "auth.flash";

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        login,
        login_broker,
        callback,
        logout,
        logout_broker,
        logout_callback,
        failed,
        identities
    ),
    components(schemas(health::Health, identities::Identities, crate::auth::Identity)),
    tags(
        (name = "authbroker", description = "Authentication broker API")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Shared by every handler through an `Extension` layer.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub sessions: Arc<MemorySessionStore>,
    pub base_url: Url,
    pub shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Arc<Registry>, sessions: Arc<MemorySessionStore>, base_url: Url) -> Self {
        Self {
            registry,
            sessions,
            base_url,
            shutdown: CancellationToken::new(),
        }
    }

    fn session_cookie(&self, id: &str) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.sessions.ttl().as_secs()
        );
        if self.base_url.scheme() == "https" {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Build the application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/auth/login", get(auth::login))
        .route("/auth/login/:broker", get(auth::login_broker))
        .route("/auth/callback/:broker", get(auth::callback))
        .route("/auth/logout", get(auth::logout))
        .route("/auth/logout/:broker", get(auth::logout_broker))
        .route("/auth/logout-callback", get(auth::logout_callback))
        .route("/auth/failed", get(auth::failed))
        .route("/auth/identities", get(identities::identities))
        .layer(middleware::from_fn(session_cookie));

    Router::new()
        .merge(auth_routes)
        .route("/health", get(health::health).options(health::health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => shutdown.cancel(),
                () = shutdown.cancelled() => {}
            }
            info!("Gracefully shutdown");
        })
        .await?;

    telemetry::shutdown_tracer();

    Ok(())
}

fn session_id_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, id)| id.to_string())
}

/// Load the caller's session or start a new one, exposing it as `Arc<Session>`.
async fn session_cookie(
    Extension(state): Extension<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let existing = match session_id_from_cookies(request.headers()) {
        Some(id) => state.sessions.load(&id).await,
        None => None,
    };

    let (session, created): (Arc<Session>, bool) = match existing {
        Some(session) => (session, false),
        None => match state.sessions.create().await {
            Ok(session) => (session, true),
            Err(err) => {
                error!("failed to create session: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
    };

    request.extensions_mut().insert(session.clone());
    let mut response = next.run(request).await;

    if created {
        match HeaderValue::from_str(&state.session_cookie(session.id())) {
            Ok(cookie) => {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Err(err) => error!("invalid session cookie: {err}"),
        }
    }
    response
}

fn make_span(request: &axum::http::Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state(base: &str) -> Result<AppState, Box<dyn std::error::Error>> {
        Ok(AppState::new(
            Arc::new(Registry::new(vec![])?),
            Arc::new(MemorySessionStore::new(Duration::from_secs(600))),
            Url::parse(base)?,
        ))
    }

    #[test]
    fn cookie_is_secure_on_https() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(
            state("https://app.example.test")?.session_cookie("abc"),
            "authbroker_session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=600; Secure"
        );
        assert_eq!(
            state("http://localhost:8080")?.session_cookie("abc"),
            "authbroker_session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=600"
        );
        Ok(())
    }

    #[test]
    fn session_id_is_read_from_any_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            COOKIE,
            HeaderValue::from_static("lang=en; authbroker_session=xyz"),
        );
        assert_eq!(session_id_from_cookies(&headers).as_deref(), Some("xyz"));
        assert_eq!(session_id_from_cookies(&HeaderMap::new()), None);
    }

    #[test]
    fn openapi_lists_auth_paths() {
        let doc = openapi();
        assert!(doc.paths.paths.contains_key("/health"));
        assert!(doc.paths.paths.contains_key("/auth/login/{broker}"));
        assert!(doc.paths.paths.contains_key("/auth/identities"));
    }
}
