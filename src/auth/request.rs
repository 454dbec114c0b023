//! Per-request input handed to brokers.

use super::AuthError;
use crate::session::Session;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Cancellation scope of one request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
}

impl RequestContext {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` unless the request is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Upstream` when the context is cancelled before `fut` completes.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, AuthError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AuthError::Upstream("request cancelled".to_string())),
            output = fut => Ok(output),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthRequest {
    context: RequestContext,
    session: Arc<Session>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    base_url: Url,
}

impl AuthRequest {
    #[must_use]
    pub fn new(session: Arc<Session>, base_url: Url) -> Self {
        Self {
            context: RequestContext::default(),
            session,
            query: HashMap::new(),
            headers: HeaderMap::new(),
            base_url,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Absolute URL of an application path such as `/auth/callback/oidc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the joined URL is not valid.
    pub fn url_for(&self, path: &str) -> Result<Url, AuthError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}"))
            .map_err(|err| AuthError::InvalidRequest(format!("invalid application url: {err}")))
    }
}
