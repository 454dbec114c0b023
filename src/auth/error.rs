use crate::sync::store::StoreError;
use thiserror::Error;

/// Failures surfaced by brokers, the registry and the synchronizer.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No valid credential for this broker; callers fall back to a guest view.
    #[error("not identified")]
    NotIdentified,
    /// Forged, expired or replayed login state.
    #[error("state mismatch")]
    StateMismatch,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("broker not found: {0}")]
    BrokerNotFound(String),
    #[error("broker {broker} does not support {capability}")]
    Unsupported {
        broker: String,
        capability: &'static str,
    },
    #[error("duplicate broker name: {0}")]
    DuplicateBroker(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session data error")]
    SessionData(#[from] serde_json::Error),
}

impl AuthError {
    pub(crate) fn unsupported(broker: &str, capability: &'static str) -> Self {
        Self::Unsupported {
            broker: broker.to_string(),
            capability,
        }
    }

    /// Errors a user can recover from by restarting the login flow.
    #[must_use]
    pub fn is_login_failure(&self) -> bool {
        matches!(
            self,
            Self::StateMismatch | Self::Upstream(_) | Self::InvalidRequest(_)
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_failures_are_recoverable() {
        assert!(AuthError::StateMismatch.is_login_failure());
        assert!(AuthError::Upstream("idp down".to_string()).is_login_failure());
        assert!(AuthError::InvalidRequest("missing code".to_string()).is_login_failure());
        assert!(!AuthError::NotIdentified.is_login_failure());
        assert!(!AuthError::BrokerNotFound("x".to_string()).is_login_failure());
    }

    #[test]
    fn store_errors_become_store_unavailable() {
        let err = AuthError::from(StoreError::Backend("connection refused".to_string()));
        assert!(
            matches!(err, AuthError::StoreUnavailable(ref message) if message.contains("connection refused"))
        );
    }

    #[test]
    fn unsupported_names_the_capability() {
        let err = AuthError::unsupported("basic", "callback");
        assert_eq!(err.to_string(), "broker basic does not support callback");
    }
}
