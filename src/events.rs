//! Login and logout notifications.

use crate::auth::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub broker: String,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutEvent {
    pub broker: String,
    /// Subject identified right before the logout, if any.
    pub subject: Option<String>,
}

/// Receives events after a login or logout completed.
///
/// Sinks must not fail the flow, so the methods return nothing.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn login(&self, event: &LoginEvent);

    async fn logout(&self, event: &LogoutEvent);
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn login(&self, event: &LoginEvent) {
        info!(
            broker = %event.broker,
            subject = %event.identity.subject(),
            "login succeeded"
        );
    }

    async fn logout(&self, event: &LogoutEvent) {
        info!(
            broker = %event.broker,
            subject = event.subject.as_deref().unwrap_or("-"),
            "logout"
        );
    }
}
