//! Ordered set of brokers and the flows that span them.
//!
//! The registry owns redirect bookkeeping, login/logout events and the
//! single-session check so individual brokers only deal with their own
//! mechanism.

use super::{AuthError, AuthRequest, Broker, BrokerResponse, Identity, LOGOUT_CALLBACK_PATH};
use crate::events::{EventSink, LoginEvent, LogoutEvent, TracingEventSink};
use crate::sync::Synchronizer;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

pub const REDIRECT_KEY: &str = "auth.redirect";
pub const LOGOUT_REDIRECTS_KEY: &str = "auth.logout.redirects";
pub const LOGOUT_TARGET_KEY: &str = "auth.logout.target";
pub const REDIRECT_PARAM: &str = "redirecturl";
pub const POST_LOGOUT_REDIRECT_PARAM: &str = "post_logout_redirect_uri";

/// What `identify` does when the synchronizer backend fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Keep the session and log a warning.
    #[default]
    FailOpen,
    /// Treat the session as logged out.
    FailClosed,
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "fail-open" => Ok(Self::FailOpen),
            "closed" | "fail-closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown store failure policy: {other}")),
        }
    }
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => f.write_str("open"),
            Self::FailClosed => f.write_str("closed"),
        }
    }
}

pub struct Registry {
    brokers: Vec<Arc<dyn Broker>>,
    synchronizer: Option<Arc<dyn Synchronizer>>,
    events: Arc<dyn EventSink>,
    failure_policy: StoreFailurePolicy,
}

impl Registry {
    /// Register brokers in lookup order.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateBroker` when two brokers share a name.
    pub fn new(brokers: Vec<Arc<dyn Broker>>) -> Result<Self, AuthError> {
        let mut seen = HashSet::new();
        for broker in &brokers {
            if !seen.insert(broker.name().to_string()) {
                return Err(AuthError::DuplicateBroker(broker.name().to_string()));
            }
        }
        Ok(Self {
            brokers,
            synchronizer: None,
            events: Arc::new(TracingEventSink),
            failure_policy: StoreFailurePolicy::default(),
        })
    }

    #[must_use]
    pub fn with_synchronizer(mut self, synchronizer: Arc<dyn Synchronizer>) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn broker_names(&self) -> Vec<&str> {
        self.brokers.iter().map(|broker| broker.name()).collect()
    }

    /// # Errors
    ///
    /// Returns `BrokerNotFound` for unknown names.
    pub fn broker(&self, name: &str) -> Result<&Arc<dyn Broker>, AuthError> {
        self.brokers
            .iter()
            .find(|broker| broker.name() == name)
            .ok_or_else(|| AuthError::BrokerNotFound(name.to_string()))
    }

    async fn session_is_active(
        &self,
        broker: &dyn Broker,
        identity: &Identity,
        request: &AuthRequest,
    ) -> bool {
        let Some(sync) = &self.synchronizer else {
            return true;
        };
        // Only interactive logins rotate the hash.
        if broker.callback_handler().is_none() {
            return true;
        }
        match sync.is_active(identity, request.session()).await {
            Ok(active) => active,
            Err(err) => match self.failure_policy {
                StoreFailurePolicy::FailOpen => {
                    warn!(
                        broker = broker.name(),
                        "session check failed, keeping session: {err}"
                    );
                    true
                }
                StoreFailurePolicy::FailClosed => {
                    warn!(
                        broker = broker.name(),
                        "session check failed, logging out: {err}"
                    );
                    false
                }
            },
        }
    }

    async fn identify_with(
        &self,
        broker: &dyn Broker,
        request: &AuthRequest,
    ) -> Result<Identity, AuthError> {
        let identity = broker.identify(request).await?;
        if self.session_is_active(broker, &identity, request).await {
            return Ok(identity);
        }

        debug!(
            broker = broker.name(),
            subject = identity.subject(),
            "session superseded"
        );
        if let Some(logouter) = broker.logouter() {
            if let Err(err) = logouter.logout(request).await {
                warn!(broker = broker.name(), "logout of superseded session failed: {err}");
            }
        }
        if let Some(sync) = &self.synchronizer {
            sync.clear(broker.name(), request.session()).await;
        }
        Err(AuthError::NotIdentified)
    }

    /// Every identity the request carries, in registration order.
    pub async fn identify_all(&self, request: &AuthRequest) -> Vec<Identity> {
        let mut identities = Vec::new();
        for broker in &self.brokers {
            match self.identify_with(broker.as_ref(), request).await {
                Ok(identity) => identities.push(identity),
                Err(AuthError::NotIdentified) => {}
                Err(err) => debug!(broker = broker.name(), "identify failed: {err}"),
            }
        }
        identities
    }

    /// First identity found in registration order.
    ///
    /// # Errors
    ///
    /// Returns `NotIdentified` when no broker recognises the request.
    #[instrument(skip_all)]
    pub async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
        for broker in &self.brokers {
            match self.identify_with(broker.as_ref(), request).await {
                Ok(identity) => return Ok(identity),
                Err(AuthError::NotIdentified) => {}
                Err(err) => debug!(broker = broker.name(), "identify failed: {err}"),
            }
        }
        Err(AuthError::NotIdentified)
    }

    /// # Errors
    ///
    /// Returns `BrokerNotFound` for unknown names, otherwise the broker's error.
    pub async fn identify_for(
        &self,
        name: &str,
        request: &AuthRequest,
    ) -> Result<Identity, AuthError> {
        let broker = self.broker(name)?;
        self.identify_with(broker.as_ref(), request).await
    }

    /// Start a login with the first broker that supports one.
    ///
    /// # Errors
    ///
    /// Returns `BrokerNotFound` when no broker is interactive.
    pub async fn authenticate(&self, request: &AuthRequest) -> Result<BrokerResponse, AuthError> {
        let broker = self
            .brokers
            .iter()
            .find(|broker| broker.authenticator().is_some())
            .ok_or_else(|| AuthError::BrokerNotFound("no interactive broker".to_string()))?;
        self.start_login(broker.as_ref(), request).await
    }

    /// # Errors
    ///
    /// Returns `BrokerNotFound` or `Unsupported`, otherwise the broker's error.
    pub async fn authenticate_for(
        &self,
        name: &str,
        request: &AuthRequest,
    ) -> Result<BrokerResponse, AuthError> {
        let broker = self.broker(name)?;
        self.start_login(broker.as_ref(), request).await
    }

    #[instrument(skip_all, fields(broker = broker.name()))]
    async fn start_login(
        &self,
        broker: &dyn Broker,
        request: &AuthRequest,
    ) -> Result<BrokerResponse, AuthError> {
        let authenticator = broker
            .authenticator()
            .ok_or_else(|| AuthError::unsupported(broker.name(), "authenticate"))?;
        let target = redirect_target(request);
        request.session().insert(REDIRECT_KEY, &target).await?;
        authenticator.authenticate(request).await
    }

    /// Finish a login and send the user back to where it started.
    ///
    /// # Errors
    ///
    /// Returns `BrokerNotFound` or `Unsupported`, otherwise the broker's error.
    #[instrument(skip_all, fields(broker = name))]
    pub async fn callback_for(
        &self,
        name: &str,
        request: &AuthRequest,
    ) -> Result<BrokerResponse, AuthError> {
        let broker = self.broker(name)?;
        let handler = broker
            .callback_handler()
            .ok_or_else(|| AuthError::unsupported(name, "callback"))?;

        let return_to = request
            .session()
            .get::<String>(REDIRECT_KEY)
            .await
            .unwrap_or_else(|| app_root(request));
        let response = handler.callback(request, &return_to).await?;
        request.session().remove(REDIRECT_KEY).await;

        match broker.identify(request).await {
            Ok(identity) => {
                if let Some(sync) = &self.synchronizer {
                    if let Err(err) = sync.insert(&identity, request.session()).await {
                        warn!(
                            subject = identity.subject(),
                            "session synchronization failed: {err}"
                        );
                    }
                }
                self.events
                    .login(&LoginEvent {
                        broker: name.to_string(),
                        identity,
                    })
                    .await;
            }
            Err(err) => debug!("no identity after callback: {err}"),
        }
        Ok(response)
    }

    /// Log out of every broker that supports it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be updated.
    #[instrument(skip_all)]
    pub async fn logout(&self, request: &AuthRequest) -> Result<BrokerResponse, AuthError> {
        let mut external = Vec::new();
        for broker in &self.brokers {
            external.extend(self.logout_broker(broker.as_ref(), request).await);
        }
        self.finish_logout(request, &self.broker_names(), external)
            .await
    }

    /// # Errors
    ///
    /// Returns `BrokerNotFound` or `Unsupported` for the named broker.
    #[instrument(skip_all, fields(broker = name))]
    pub async fn logout_for(
        &self,
        name: &str,
        request: &AuthRequest,
    ) -> Result<BrokerResponse, AuthError> {
        let broker = self.broker(name)?;
        if broker.logouter().is_none() {
            return Err(AuthError::unsupported(name, "logout"));
        }
        let external = self.logout_broker(broker.as_ref(), request).await;
        self.finish_logout(request, &[name], external.into_iter().collect())
            .await
    }

    async fn logout_broker(&self, broker: &dyn Broker, request: &AuthRequest) -> Option<String> {
        let logouter = broker.logouter()?;
        let subject = broker
            .identify(request)
            .await
            .ok()
            .map(|identity| identity.subject().to_string());

        let external = match logouter.logout(request).await {
            Ok(url) => url.map(String::from),
            Err(err) => {
                warn!(broker = broker.name(), "logout failed: {err}");
                None
            }
        };
        self.events
            .logout(&LogoutEvent {
                broker: broker.name().to_string(),
                subject,
            })
            .await;
        external
    }

    async fn finish_logout(
        &self,
        request: &AuthRequest,
        brokers: &[&str],
        external: Vec<String>,
    ) -> Result<BrokerResponse, AuthError> {
        if let Some(sync) = &self.synchronizer {
            for broker in brokers {
                sync.clear(broker, request.session()).await;
            }
        }

        let target = redirect_target(request);
        if external.is_empty() {
            return Ok(BrokerResponse::Redirect(target));
        }

        let session = request.session();
        session.insert(LOGOUT_TARGET_KEY, &target).await?;
        session.insert(LOGOUT_REDIRECTS_KEY, &external).await?;
        Ok(BrokerResponse::Redirect(
            request.url_for(LOGOUT_CALLBACK_PATH)?.into(),
        ))
    }

    /// Walk the queued external logout URLs, then return to the stored target.
    ///
    /// # Errors
    ///
    /// Returns an error if the logout-callback URL cannot be built.
    pub async fn logout_callback(
        &self,
        request: &AuthRequest,
    ) -> Result<BrokerResponse, AuthError> {
        let next = request
            .session()
            .modify(|values| {
                let mut queued: Vec<String> = values
                    .get(LOGOUT_REDIRECTS_KEY)
                    .and_then(|value| serde_json::from_value(value.clone()).ok())
                    .unwrap_or_default();
                if queued.is_empty() {
                    values.remove(LOGOUT_REDIRECTS_KEY);
                    return None;
                }
                let next = queued.remove(0);
                if queued.is_empty() {
                    values.remove(LOGOUT_REDIRECTS_KEY);
                } else {
                    values.insert(LOGOUT_REDIRECTS_KEY.to_string(), Value::from(queued));
                }
                Some(next)
            })
            .await;

        let callback = request.url_for(LOGOUT_CALLBACK_PATH)?;
        if let Some(next) = next {
            return match Url::parse(&next) {
                Ok(mut url) => {
                    url.query_pairs_mut()
                        .append_pair(POST_LOGOUT_REDIRECT_PARAM, callback.as_str());
                    Ok(BrokerResponse::Redirect(url.into()))
                }
                Err(err) => {
                    warn!("skipping invalid logout url {next}: {err}");
                    Ok(BrokerResponse::Redirect(callback.into()))
                }
            };
        }

        let target = request
            .session()
            .remove(LOGOUT_TARGET_KEY)
            .await
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| app_root(request));
        Ok(BrokerResponse::Redirect(target))
    }
}

fn app_root(request: &AuthRequest) -> String {
    request.base_url().as_str().to_string()
}

/// `redirecturl`, then `Referer`, then the application root.
fn redirect_target(request: &AuthRequest) -> String {
    request
        .query_param(REDIRECT_PARAM)
        .filter(|value| !value.is_empty())
        .or_else(|| request.header("referer"))
        .and_then(|candidate| same_origin(request.base_url(), candidate))
        .unwrap_or_else(|| app_root(request))
}

/// Accept relative paths and absolute URLs on the application's own origin.
fn same_origin(base: &Url, candidate: &str) -> Option<String> {
    if candidate.starts_with('/') {
        if candidate.starts_with("//") || candidate.contains('\\') {
            return None;
        }
        return Some(candidate.to_string());
    }
    let url = Url::parse(candidate).ok()?;
    let same = url.scheme() == base.scheme()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default();
    same.then(|| url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::basic::BasicBroker;
    use crate::auth::static_broker::StaticBroker;
    use crate::auth::{CallbackHandler, Logouter};
    use crate::events::tests::RecordingSink;
    use crate::session::{MemorySessionStore, Session};
    use crate::sync::store::memory::MemoryStore;
    use crate::sync::store::{Store, StoreError};
    use crate::sync::SessionSynchronizer;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue};
    use std::collections::HashMap;

    const BASE: &str = "https://app.example.test";

    /// Interactive broker whose logout points at an external URL.
    struct Federated {
        name: String,
        inner: StaticBroker,
        logout_url: Url,
    }

    impl Federated {
        fn new(name: &str) -> Result<Self, url::ParseError> {
            Ok(Self {
                name: name.to_string(),
                inner: StaticBroker::new(name, vec!["alice".to_string()]),
                logout_url: Url::parse(&format!("https://{name}.idp.test/logout"))?,
            })
        }
    }

    #[async_trait]
    impl Broker for Federated {
        fn name(&self) -> &str {
            &self.name
        }

        async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
            self.inner.identify(request).await
        }

        fn callback_handler(&self) -> Option<&dyn CallbackHandler> {
            self.inner.callback_handler()
        }

        fn logouter(&self) -> Option<&dyn Logouter> {
            Some(self)
        }
    }

    #[async_trait]
    impl Logouter for Federated {
        async fn logout(&self, request: &AuthRequest) -> Result<Option<Url>, AuthError> {
            if let Some(logouter) = self.inner.logouter() {
                logouter.logout(request).await?;
            }
            Ok(Some(self.logout_url.clone()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn set_hash_and_session_id_for_user(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn get_hash_by_user(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn destroy_sessions_for_user(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
    }

    fn request(
        session: &Arc<Session>,
        query: &[(&str, &str)],
    ) -> Result<AuthRequest, url::ParseError> {
        let query: HashMap<String, String> = query
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Ok(AuthRequest::new(session.clone(), Url::parse(BASE)?).with_query(query))
    }

    fn static_broker(name: &str) -> Arc<dyn Broker> {
        Arc::new(StaticBroker::new(name, vec!["alice".to_string(), "bob".to_string()]))
    }

    fn basic_broker() -> Result<Arc<dyn Broker>, String> {
        let users = crate::auth::basic::parse_users("carol:secret")?;
        Ok(Arc::new(BasicBroker::new("basic", users)))
    }

    async fn login(
        registry: &Registry,
        session: &Arc<Session>,
        broker: &str,
        user: &str,
    ) -> Result<BrokerResponse, Box<dyn std::error::Error>> {
        registry
            .authenticate_for(broker, &request(session, &[(REDIRECT_PARAM, "/dashboard")])?)
            .await?;
        Ok(registry
            .callback_for(broker, &request(session, &[("user", user)])?)
            .await?)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Registry::new(vec![static_broker("dev"), static_broker("dev")]);
        assert!(matches!(result, Err(AuthError::DuplicateBroker(name)) if name == "dev"));
    }

    #[test]
    fn failure_policy_parses() {
        assert_eq!(
            "open".parse::<StoreFailurePolicy>(),
            Ok(StoreFailurePolicy::FailOpen)
        );
        assert_eq!(
            "Closed".parse::<StoreFailurePolicy>(),
            Ok(StoreFailurePolicy::FailClosed)
        );
        assert!("sometimes".parse::<StoreFailurePolicy>().is_err());
        assert_eq!(StoreFailurePolicy::default().to_string(), "open");
    }

    #[tokio::test]
    async fn unknown_and_unsupported_brokers() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::new(vec![basic_broker()?, static_broker("dev")])?;
        let session = Arc::new(Session::new("s1"));
        let req = request(&session, &[])?;

        assert!(matches!(
            registry.authenticate_for("nope", &req).await,
            Err(AuthError::BrokerNotFound(_))
        ));
        assert!(matches!(
            registry.identify_for("nope", &req).await,
            Err(AuthError::BrokerNotFound(_))
        ));
        assert!(matches!(
            registry.callback_for("basic", &req).await,
            Err(AuthError::Unsupported { capability: "callback", .. })
        ));
        assert!(matches!(
            registry.logout_for("basic", &req).await,
            Err(AuthError::Unsupported { capability: "logout", .. })
        ));
        assert_eq!(registry.broker_names(), ["basic", "dev"]);
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_uses_first_interactive_broker() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::new(vec![basic_broker()?, static_broker("dev")])?;
        let session = Arc::new(Session::new("s1"));

        let response = registry.authenticate(&request(&session, &[])?).await?;
        let BrokerResponse::Challenge { realm } = response else {
            return Err("basic is registered first and answers with a challenge".into());
        };
        assert_eq!(realm, crate::auth::basic::DEFAULT_REALM);

        let registry = Registry::new(vec![])?;
        assert!(matches!(
            registry.authenticate(&request(&session, &[])?).await,
            Err(AuthError::BrokerNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn callback_returns_to_stored_target() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(RecordingSink::default());
        let registry = Registry::new(vec![static_broker("dev")])?.with_event_sink(sink.clone());
        let session = Arc::new(Session::new("s1"));

        let response = login(&registry, &session, "dev", "alice").await?;
        assert_eq!(response.location(), Some("/dashboard"));
        assert!(!session.contains(REDIRECT_KEY).await);

        let identity = registry.identify(&request(&session, &[])?).await?;
        assert_eq!(identity.subject(), "alice");
        assert_eq!(registry.identify_all(&request(&session, &[])?).await, [identity.clone()]);
        assert_eq!(sink.logins.lock().await.len(), 1);
        assert_eq!(sink.logins.lock().await[0].identity, identity);
        Ok(())
    }

    #[tokio::test]
    async fn failed_callback_keeps_target() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::new(vec![static_broker("dev")])?;
        let session = Arc::new(Session::new("s1"));
        registry
            .authenticate_for("dev", &request(&session, &[(REDIRECT_PARAM, "/x")])?)
            .await?;

        let result = registry
            .callback_for("dev", &request(&session, &[("user", "mallory")])?)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidRequest(_))));
        assert_eq!(session.get::<String>(REDIRECT_KEY).await.as_deref(), Some("/x"));
        Ok(())
    }

    #[tokio::test]
    async fn redirect_targets_must_be_same_origin() -> Result<(), Box<dyn std::error::Error>> {
        let session = Arc::new(Session::new("s1"));
        let root = "https://app.example.test/";

        let cases = [
            ("/reports?page=2", "/reports?page=2"),
            ("https://app.example.test/deep/link", "https://app.example.test/deep/link"),
            ("https://evil.example.test/", root),
            ("//evil.example.test/", root),
            ("http://app.example.test/", root),
            ("https://app.example.test:8443/", root),
            ("javascript:alert(1)", root),
            ("/\\evil.example.test", root),
        ];
        for (candidate, expected) in cases {
            let req = request(&session, &[(REDIRECT_PARAM, candidate)])?;
            assert_eq!(redirect_target(&req), expected, "{candidate}");
        }

        let mut headers = HeaderMap::new();
        headers.insert("referer", HeaderValue::from_static("https://app.example.test/from"));
        let req = request(&session, &[])?.with_headers(headers);
        assert_eq!(redirect_target(&req), "https://app.example.test/from");

        assert_eq!(redirect_target(&request(&session, &[])?), root);
        Ok(())
    }

    #[tokio::test]
    async fn logout_without_external_urls_redirects_to_target() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(RecordingSink::default());
        let registry = Registry::new(vec![static_broker("dev")])?.with_event_sink(sink.clone());
        let session = Arc::new(Session::new("s1"));
        login(&registry, &session, "dev", "alice").await?;

        let response = registry
            .logout(&request(&session, &[(REDIRECT_PARAM, "/bye")])?)
            .await?;
        assert_eq!(response.location(), Some("/bye"));
        assert!(matches!(
            registry.identify(&request(&session, &[])?).await,
            Err(AuthError::NotIdentified)
        ));
        let logouts = sink.logouts.lock().await;
        assert_eq!(logouts.len(), 1);
        assert_eq!(logouts[0].subject.as_deref(), Some("alice"));
        Ok(())
    }

    #[tokio::test]
    async fn logout_chains_external_urls() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::new(vec![
            Arc::new(Federated::new("one")?),
            Arc::new(Federated::new("two")?),
            static_broker("dev"),
        ])?;
        let session = Arc::new(Session::new("s1"));
        let callback = format!("{BASE}{LOGOUT_CALLBACK_PATH}");

        let response = registry
            .logout(&request(&session, &[(REDIRECT_PARAM, "/bye")])?)
            .await?;
        assert_eq!(response.location(), Some(callback.as_str()));

        let mut visited = Vec::new();
        for _ in 0..2 {
            let response = registry.logout_callback(&request(&session, &[])?).await?;
            let url = Url::parse(response.location().ok_or("expected redirect")?)?;
            let back = url
                .query_pairs()
                .find(|(key, _)| key == POST_LOGOUT_REDIRECT_PARAM)
                .map(|(_, value)| value.into_owned());
            assert_eq!(back.as_deref(), Some(callback.as_str()));
            visited.push(url.host_str().unwrap_or_default().to_string());
        }
        assert_eq!(visited, ["one.idp.test", "two.idp.test"]);

        let response = registry.logout_callback(&request(&session, &[])?).await?;
        assert_eq!(response.location(), Some("/bye"));
        assert!(!session.contains(LOGOUT_REDIRECTS_KEY).await);
        assert!(!session.contains(LOGOUT_TARGET_KEY).await);

        let response = registry.logout_callback(&request(&session, &[])?).await?;
        assert_eq!(response.location(), Some("https://app.example.test/"));
        Ok(())
    }

    #[tokio::test]
    async fn logout_for_only_touches_that_broker() -> Result<(), Box<dyn std::error::Error>> {
        let registry = Registry::new(vec![static_broker("a"), static_broker("b")])?;
        let session = Arc::new(Session::new("s1"));
        login(&registry, &session, "a", "alice").await?;
        login(&registry, &session, "b", "bob").await?;

        registry.logout_for("a", &request(&session, &[])?).await?;
        let identities = registry.identify_all(&request(&session, &[])?).await;
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].subject(), "bob");
        Ok(())
    }

    #[tokio::test]
    async fn superseded_session_is_logged_out() -> Result<(), Box<dyn std::error::Error>> {
        let sessions = Arc::new(MemorySessionStore::default());
        let sync = Arc::new(SessionSynchronizer::new(Arc::new(MemoryStore::new(sessions))));
        let registry =
            Registry::new(vec![static_broker("dev"), basic_broker()?])?.with_synchronizer(sync);

        let first = Arc::new(Session::new("first"));
        let second = Arc::new(Session::new("second"));
        login(&registry, &first, "dev", "alice").await?;
        assert_eq!(registry.identify(&request(&first, &[])?).await?.subject(), "alice");

        login(&registry, &second, "dev", "alice").await?;
        assert_eq!(registry.identify(&request(&second, &[])?).await?.subject(), "alice");
        assert!(matches!(
            registry.identify(&request(&first, &[])?).await,
            Err(AuthError::NotIdentified)
        ));
        assert!(!first.contains("auth.static.dev.identity").await);
        Ok(())
    }

    #[tokio::test]
    async fn logins_through_two_brokers_stay_active() -> Result<(), Box<dyn std::error::Error>> {
        let sessions = Arc::new(MemorySessionStore::default());
        let sync = Arc::new(SessionSynchronizer::new(Arc::new(MemoryStore::new(sessions))));
        let registry = Registry::new(vec![static_broker("a"), static_broker("b")])?
            .with_synchronizer(sync);
        let session = Arc::new(Session::new("s1"));

        login(&registry, &session, "a", "alice").await?;
        login(&registry, &session, "b", "bob").await?;
        let identities = registry.identify_all(&request(&session, &[])?).await;
        let subjects: Vec<&str> = identities.iter().map(Identity::subject).collect();
        assert_eq!(subjects, ["alice", "bob"]);

        registry.logout_for("a", &request(&session, &[])?).await?;
        let identities = registry.identify_all(&request(&session, &[])?).await;
        let subjects: Vec<&str> = identities.iter().map(Identity::subject).collect();
        assert_eq!(subjects, ["bob"]);
        assert!(session.contains(&crate::sync::session_hash_key("b")).await);
        Ok(())
    }

    #[tokio::test]
    async fn store_failures_follow_the_policy() -> Result<(), Box<dyn std::error::Error>> {
        let sync: Arc<dyn Synchronizer> =
            Arc::new(SessionSynchronizer::new(Arc::new(BrokenStore)));

        let open = Registry::new(vec![static_broker("dev")])?.with_synchronizer(sync.clone());
        let session = Arc::new(Session::new("s1"));
        let response = login(&open, &session, "dev", "alice").await?;
        assert_eq!(response.location(), Some("/dashboard"));
        session
            .insert(&crate::sync::session_hash_key("dev"), "h")
            .await?;
        assert!(open.identify(&request(&session, &[])?).await.is_ok());

        let closed = Registry::new(vec![static_broker("dev")])?
            .with_synchronizer(sync)
            .with_failure_policy(StoreFailurePolicy::FailClosed);
        assert!(matches!(
            closed.identify(&request(&session, &[])?).await,
            Err(AuthError::NotIdentified)
        ));
        Ok(())
    }
}
