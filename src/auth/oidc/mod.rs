//! OpenID Connect authorization-code broker.
//!
//! `authenticate` parks a fresh state token in the session and redirects to the
//! provider. `callback` consumes that token, exchanges the code, verifies the ID
//! token and stores a [`SessionTokenRecord`]. `identify` reads the record back,
//! refreshing the access token when it went stale.

pub mod client;
pub mod state;
pub mod verifier;

use self::client::{OAuthClient, TokenSet};
use self::state::{Clock, StateStore, SystemClock};
use self::verifier::{decode_unverified, IdTokenClaims, IdTokenVerifier};
use super::{
    AuthError, AuthRequest, Authenticator, Broker, BrokerResponse, CallbackHandler, Identity,
    IdentityRefresher, Logouter, CALLBACK_PATH,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";

#[derive(Clone, Debug)]
pub struct OidcConfig {
    broker: String,
    scopes: Vec<String>,
    offline_access: bool,
    state_lifetime: Duration,
    end_session: bool,
    id_token_claims: BTreeMap<String, String>,
    access_token_claims: BTreeMap<String, String>,
    auth_params: Vec<(String, String)>,
}

impl OidcConfig {
    #[must_use]
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            scopes: Vec::new(),
            offline_access: false,
            state_lifetime: state::DEFAULT_STATE_LIFETIME,
            end_session: false,
            id_token_claims: BTreeMap::new(),
            access_token_claims: BTreeMap::new(),
            auth_params: Vec::new(),
        }
    }

    /// Scopes requested in addition to `openid`.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn with_offline_access(mut self, enabled: bool) -> Self {
        self.offline_access = enabled;
        self
    }

    #[must_use]
    pub fn with_state_lifetime(mut self, lifetime: Duration) -> Self {
        self.state_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_end_session(mut self, enabled: bool) -> Self {
        self.end_session = enabled;
        self
    }

    /// Map `attribute -> claim` read from the verified ID token.
    #[must_use]
    pub fn with_id_token_claims(mut self, claims: BTreeMap<String, String>) -> Self {
        self.id_token_claims = claims;
        self
    }

    /// Map `attribute -> claim` read from the access token payload or token response.
    #[must_use]
    pub fn with_access_token_claims(mut self, claims: BTreeMap<String, String>) -> Self {
        self.access_token_claims = claims;
        self
    }

    #[must_use]
    pub fn with_auth_params(mut self, params: Vec<(String, String)>) -> Self {
        self.auth_params = params;
        self
    }

    #[must_use]
    pub fn broker(&self) -> &str {
        &self.broker
    }

    #[must_use]
    pub fn state_lifetime(&self) -> Duration {
        self.state_lifetime
    }

    /// Requested scopes: `openid` first, then configured ones, then `offline_access`.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = vec![SCOPE_OPENID.to_string()];
        for scope in &self.scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        if self.offline_access && !scopes.iter().any(|s| s == SCOPE_OFFLINE_ACCESS) {
            scopes.push(SCOPE_OFFLINE_ACCESS.to_string());
        }
        scopes
    }
}

/// Parse `attribute=claim` pairs separated by commas.
///
/// # Errors
///
/// Returns an error naming the first entry without `=`.
pub fn parse_claim_mapping(input: &str) -> Result<BTreeMap<String, String>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .filter(|(name, claim)| !name.is_empty() && !claim.is_empty())
                .map(|(name, claim)| (name.trim().to_string(), claim.trim().to_string()))
                .ok_or_else(|| format!("invalid claim mapping entry: {entry}"))
        })
        .collect()
}

/// Tokens and mapped claims stored in the session after a successful callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionTokenRecord {
    pub token: TokenSet,
    pub subject: String,
    #[serde(default)]
    pub id_token_claims: BTreeMap<String, Value>,
    #[serde(default)]
    pub access_token_claims: BTreeMap<String, Value>,
}

impl SessionTokenRecord {
    fn identity(&self, broker: &str) -> Identity {
        let mut attributes = self.id_token_claims.clone();
        for (name, value) in &self.access_token_claims {
            attributes.entry(name.clone()).or_insert_with(|| value.clone());
        }
        Identity::new(&self.subject, broker).with_attributes(attributes)
    }
}

/// Optional hook for `error=` callbacks, e.g. retrying without `prompt=none`.
#[async_trait]
pub trait CallbackErrorHandler: Send + Sync {
    /// Return `Some` to answer the callback instead of failing it.
    async fn handle(
        &self,
        request: &AuthRequest,
        error: &str,
        description: &str,
    ) -> Result<Option<BrokerResponse>, AuthError>;
}

pub struct OidcBroker {
    config: OidcConfig,
    client: Arc<dyn OAuthClient>,
    verifier: Arc<dyn IdTokenVerifier>,
    states: StateStore,
    clock: Arc<dyn Clock>,
    error_handler: Option<Arc<dyn CallbackErrorHandler>>,
    record_key: String,
}

impl OidcBroker {
    #[must_use]
    pub fn new(
        config: OidcConfig,
        client: Arc<dyn OAuthClient>,
        verifier: Arc<dyn IdTokenVerifier>,
    ) -> Self {
        let states = StateStore::new(config.broker()).with_lifetime(config.state_lifetime());
        let record_key = format!("auth.oidc.{}.sessiondata", config.broker());
        Self {
            config,
            client,
            verifier,
            states,
            clock: Arc::new(SystemClock),
            error_handler: None,
            record_key,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.states = self.states.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn CallbackErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn states(&self) -> &StateStore {
        &self.states
    }

    #[must_use]
    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    fn redirect_uri(&self, request: &AuthRequest) -> Result<Url, AuthError> {
        request.url_for(&format!("{CALLBACK_PATH}/{}", self.config.broker))
    }

    fn map_claims(
        mapping: &BTreeMap<String, String>,
        lookup: impl Fn(&str) -> Option<Value>,
    ) -> BTreeMap<String, Value> {
        mapping
            .iter()
            .filter_map(|(name, claim)| lookup(claim).map(|value| (name.clone(), value)))
            .collect()
    }

    fn access_token_claims(&self, token: &TokenSet) -> BTreeMap<String, Value> {
        if self.config.access_token_claims.is_empty() {
            return BTreeMap::new();
        }
        let payload = decode_unverified(&token.access_token).unwrap_or_default();
        Self::map_claims(&self.config.access_token_claims, |claim| {
            payload
                .get(claim)
                .or_else(|| token.extra.get(claim))
                .cloned()
        })
    }

    async fn verify(&self, request: &AuthRequest, raw: &str) -> Result<IdTokenClaims, AuthError> {
        request
            .context()
            .guard(self.verifier.verify(raw))
            .await?
            .map_err(|err| AuthError::Upstream(format!("id token verification failed: {err}")))
    }

    /// Refresh stale tokens in place. Returns whether the record changed.
    async fn ensure_fresh(
        &self,
        request: &AuthRequest,
        record: &mut SessionTokenRecord,
    ) -> Result<bool, AuthError> {
        if !record.token.needs_refresh(self.clock.now_unix()) {
            return Ok(false);
        }
        let refresh_token = record
            .token
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::Upstream("access token expired".to_string()))?;

        let mut refreshed = request
            .context()
            .guard(self.client.refresh(&refresh_token))
            .await??;
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.id_token.is_none() {
            refreshed.id_token.clone_from(&record.token.id_token);
        }
        record.access_token_claims = self.access_token_claims(&refreshed);
        record.token = refreshed;
        Ok(true)
    }

    async fn identify_record(
        &self,
        request: &AuthRequest,
        record: &mut SessionTokenRecord,
    ) -> Result<Identity, AuthError> {
        let refreshed = self.ensure_fresh(request, record).await?;

        let raw = record
            .token
            .id_token
            .clone()
            .ok_or_else(|| AuthError::Upstream("no id token in session".to_string()))?;
        let claims = self.verify(request, &raw).await?;
        if claims.sub != record.subject {
            return Err(AuthError::Upstream("id token subject changed".to_string()));
        }

        if refreshed {
            record.id_token_claims = Self::map_claims(&self.config.id_token_claims, |claim| {
                claims.claim(claim)
            });
            request.session().insert(&self.record_key, record).await?;
        }
        Ok(record.identity(&self.config.broker))
    }

    async fn fail_callback(&self, request: &AuthRequest, err: AuthError) -> AuthError {
        request.session().remove(&self.record_key).await;
        err
    }
}

#[async_trait]
impl Broker for OidcBroker {
    fn name(&self) -> &str {
        &self.config.broker
    }

    #[instrument(skip_all, fields(broker = %self.config.broker))]
    async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
        let Some(mut record) = request
            .session()
            .get::<SessionTokenRecord>(&self.record_key)
            .await
        else {
            return Err(AuthError::NotIdentified);
        };

        match self.identify_record(request, &mut record).await {
            Ok(identity) => Ok(identity),
            Err(err) => {
                debug!("dropping session tokens: {err}");
                request.session().remove(&self.record_key).await;
                Err(AuthError::NotIdentified)
            }
        }
    }

    fn authenticator(&self) -> Option<&dyn Authenticator> {
        Some(self)
    }

    fn callback_handler(&self) -> Option<&dyn CallbackHandler> {
        Some(self)
    }

    fn logouter(&self) -> Option<&dyn Logouter> {
        Some(self)
    }

    fn refresher(&self) -> Option<&dyn IdentityRefresher> {
        Some(self)
    }
}

#[async_trait]
impl Authenticator for OidcBroker {
    #[instrument(skip_all, fields(broker = %self.config.broker))]
    async fn authenticate(&self, request: &AuthRequest) -> Result<BrokerResponse, AuthError> {
        let state = self.states.issue(request.session()).await?;
        let redirect_uri = self.redirect_uri(request)?;
        let url = self.client.authorize_url(
            &state,
            redirect_uri.as_str(),
            &self.config.scopes(),
            &self.config.auth_params,
        )?;
        Ok(BrokerResponse::Redirect(url.into()))
    }
}

#[async_trait]
impl CallbackHandler for OidcBroker {
    #[instrument(skip_all, fields(broker = %self.config.broker))]
    async fn callback(
        &self,
        request: &AuthRequest,
        return_to: &str,
    ) -> Result<BrokerResponse, AuthError> {
        if let Some(error) = request.query_param("error") {
            let description = request.query_param("error_description").unwrap_or_default();
            if let Some(handler) = &self.error_handler {
                if let Some(response) = handler.handle(request, error, description).await? {
                    return Ok(response);
                }
            }
            return Err(AuthError::Upstream(format!(
                "OpenID Connect error: {error:?} ({description:?})"
            )));
        }

        let state = request
            .query_param("state")
            .ok_or(AuthError::StateMismatch)?;
        if !self.states.consume(request.session(), state).await? {
            return Err(AuthError::StateMismatch);
        }

        let code = request
            .query_param("code")
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AuthError::InvalidRequest("missing code".to_string()))?;

        let redirect_uri = self.redirect_uri(request)?;
        let token = request
            .context()
            .guard(self.client.exchange(code, redirect_uri.as_str()))
            .await??;

        let raw_id_token = token
            .id_token
            .clone()
            .ok_or_else(|| AuthError::Upstream("token response has no id_token".to_string()))?;
        let claims = self.verify(request, &raw_id_token).await?;

        let record = SessionTokenRecord {
            subject: claims.sub.clone(),
            id_token_claims: Self::map_claims(&self.config.id_token_claims, |claim| {
                claims.claim(claim)
            }),
            access_token_claims: self.access_token_claims(&token),
            token,
        };
        request.session().insert(&self.record_key, &record).await?;

        if let Err(err) = self.identify(request).await {
            warn!("identify after callback failed: {err}");
            return Err(self.fail_callback(request, err).await);
        }

        Ok(BrokerResponse::redirect(return_to))
    }
}

#[async_trait]
impl Logouter for OidcBroker {
    async fn logout(&self, request: &AuthRequest) -> Result<Option<Url>, AuthError> {
        // Nothing to end upstream for a session that never logged in here.
        let Some(record) = request.session().remove(&self.record_key).await else {
            return Ok(None);
        };
        if !self.config.end_session {
            return Ok(None);
        }
        let Some(endpoint) = self.client.end_session_endpoint() else {
            return Ok(None);
        };

        let mut url = endpoint.clone();
        let id_token = serde_json::from_value::<SessionTokenRecord>(record)
            .ok()
            .and_then(|record| record.token.id_token);
        if let Some(id_token) = id_token {
            url.query_pairs_mut().append_pair("id_token_hint", &id_token);
        }
        Ok(Some(url))
    }
}

#[async_trait]
impl IdentityRefresher for OidcBroker {
    async fn refresh_identity(&self, request: &AuthRequest) -> Result<(), AuthError> {
        let updated = request
            .session()
            .modify(|values| {
                let Some(value) = values.get_mut(&self.record_key) else {
                    return false;
                };
                if let Some(token) = value.get_mut("token").and_then(Value::as_object_mut) {
                    token.insert("access_token".to_string(), Value::String(String::new()));
                    return true;
                }
                false
            })
            .await;
        if !updated {
            return Err(AuthError::NotIdentified);
        }
        Ok(())
    }
}
