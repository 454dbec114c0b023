//! Broker capability set.
//!
//! A broker always implements [`Broker::identify`]. Interactive capabilities
//! are optional and discovered through the accessor methods, which return
//! `None` unless the broker overrides them.

pub mod basic;
pub mod error;
pub mod oidc;
pub mod registry;
pub mod request;
pub mod static_broker;

pub use self::error::AuthError;
pub use self::registry::{Registry, StoreFailurePolicy};
pub use self::request::{AuthRequest, RequestContext};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;
use utoipa::ToSchema;

pub const LOGIN_PATH: &str = "/auth/login";
pub const CALLBACK_PATH: &str = "/auth/callback";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const LOGOUT_CALLBACK_PATH: &str = "/auth/logout-callback";
pub const FAILED_PATH: &str = "/auth/failed";

/// Who a request belongs to, as resolved by one broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    subject: String,
    broker: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schema(value_type = Object)]
    attributes: BTreeMap<String, Value>,
}

impl Identity {
    #[must_use]
    pub fn new(subject: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            broker: broker.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn broker(&self) -> &str {
        &self.broker
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }
}

/// What a broker wants the HTTP layer to send back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerResponse {
    /// `302 Found` to the given location.
    Redirect(String),
    /// `401 Unauthorized` with a Basic `WWW-Authenticate` challenge.
    Challenge { realm: String },
    /// HTML rendered by the broker itself.
    Page(String),
}

impl BrokerResponse {
    #[must_use]
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::Redirect(location.into())
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::Redirect(location) => Some(location),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve the identity carried by the request.
    ///
    /// Fails with `AuthError::NotIdentified` when no valid credential exists.
    /// The only network activity allowed here is refreshing a token that was
    /// already granted.
    async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError>;

    fn authenticator(&self) -> Option<&dyn Authenticator> {
        None
    }

    fn callback_handler(&self) -> Option<&dyn CallbackHandler> {
        None
    }

    fn logouter(&self) -> Option<&dyn Logouter> {
        None
    }

    fn refresher(&self) -> Option<&dyn IdentityRefresher> {
        None
    }
}

/// Start an interactive login.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<BrokerResponse, AuthError>;
}

/// Finish an interactive login and send the user to `return_to`.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn callback(
        &self,
        request: &AuthRequest,
        return_to: &str,
    ) -> Result<BrokerResponse, AuthError>;
}

/// Clear broker-owned session keys, optionally naming an external logout URL.
#[async_trait]
pub trait Logouter: Send + Sync {
    async fn logout(&self, request: &AuthRequest) -> Result<Option<Url>, AuthError>;
}

/// Invalidate cached credentials so the next identify fetches them again.
#[async_trait]
pub trait IdentityRefresher: Send + Sync {
    async fn refresh_identity(&self, request: &AuthRequest) -> Result<(), AuthError>;
}
