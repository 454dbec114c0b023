//! OAuth2 authorization-code client.

use super::state::{Clock, SystemClock};
use crate::auth::AuthError;
use crate::APP_USER_AGENT;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Seconds before expiry at which an access token counts as stale.
const EXPIRY_LEEWAY_SECONDS: i64 = 10;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens granted by the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl TokenSet {
    /// A blank access token is always stale, so blanking forces a refresh.
    #[must_use]
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.access_token.is_empty()
            || self
                .expiry
                .is_some_and(|expiry| expiry <= now.saturating_add(EXPIRY_LEEWAY_SECONDS))
    }
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Authorization endpoint URL carrying `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built.
    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
        extra: &[(String, String)],
    ) -> Result<Url, AuthError>;

    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError>;

    fn end_session_endpoint(&self) -> Option<&Url> {
        None
    }
}

/// Subset of the OpenID provider metadata document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<Url>,
}

impl ProviderMetadata {
    /// Fetch `/.well-known/openid-configuration` below `issuer`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Upstream` if the document cannot be fetched or parsed,
    /// or if it names another issuer.
    #[instrument(skip(http))]
    pub async fn discover(http: &Client, issuer: &str) -> Result<Self, AuthError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|err| AuthError::Upstream(format!("discovery request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AuthError::Upstream(format!(
                "discovery returned {}",
                response.status()
            )));
        }
        let metadata: Self = response
            .json()
            .await
            .map_err(|err| AuthError::Upstream(format!("invalid discovery document: {err}")))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(AuthError::Upstream(format!(
                "issuer mismatch: expected {issuer}, got {}",
                metadata.issuer
            )));
        }
        debug!("discovered provider {}", metadata.issuer);
        Ok(metadata)
    }
}

/// Build the HTTP client shared by discovery, token and JWKS requests.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    id_token: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct HttpOAuthClient {
    http: Client,
    metadata: ProviderMetadata,
    client_id: String,
    client_secret: SecretString,
    clock: Arc<dyn Clock>,
}

impl HttpOAuthClient {
    #[must_use]
    pub fn new(
        http: Client,
        metadata: ProviderMetadata,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            metadata,
            client_id: client_id.into(),
            client_secret,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, AuthError> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", &self.client_id));
        form.push(("client_secret", self.client_secret.expose_secret()));

        let response = self
            .http
            .post(self.metadata.token_endpoint.clone())
            .form(&form)
            .send()
            .await
            .map_err(|err| AuthError::Upstream(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<TokenErrorResponse>()
                .await
                .map(|body| match body.error_description {
                    Some(description) => format!("{} ({description})", body.error),
                    None => body.error,
                })
                .unwrap_or_default();
            return Err(AuthError::Upstream(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Upstream(format!("invalid token response: {err}")))?;

        let now = self.clock.now_unix();
        Ok(TokenSet {
            access_token: body.access_token,
            token_type: body.token_type,
            refresh_token: body.refresh_token,
            id_token: body.id_token,
            expiry: body.expires_in.map(|seconds| now.saturating_add(seconds)),
            extra: body.extra,
        })
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    fn authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
        extra: &[(String, String)],
    ) -> Result<Url, AuthError> {
        let mut url = self.metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", state);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    #[instrument(skip(self, code))]
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    fn end_session_endpoint(&self) -> Option<&Url> {
        self.metadata.end_session_endpoint.as_ref()
    }
}
