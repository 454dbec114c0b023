//! HTTP Basic broker backed by a static `username -> password` map.

use super::{AuthError, AuthRequest, Authenticator, Broker, BrokerResponse, Identity};
use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use base64ct::{Base64, Encoding};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::debug;

pub const DEFAULT_REALM: &str = "Restricted";

pub struct BasicBroker {
    name: String,
    realm: String,
    users: HashMap<String, SecretString>,
}

impl BasicBroker {
    #[must_use]
    pub fn new(name: impl Into<String>, users: HashMap<String, SecretString>) -> Self {
        Self {
            name: name.into(),
            realm: DEFAULT_REALM.to_string(),
            users,
        }
    }

    #[must_use]
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }
}

/// Parse `user:password` pairs separated by commas.
///
/// # Errors
///
/// Returns an error naming the first entry without a `:` or with an empty user.
pub fn parse_users(input: &str) -> Result<HashMap<String, SecretString>, String> {
    let mut users = HashMap::new();
    for entry in input.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (user, password) = entry
            .split_once(':')
            .ok_or_else(|| format!("invalid basic auth user entry: {entry}"))?;
        if user.is_empty() {
            return Err(format!("invalid basic auth user entry: {entry}"));
        }
        users.insert(user.to_string(), SecretString::from(password.to_string()));
    }
    Ok(users)
}

fn basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Base64::decode_vec(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn password_matches(expected: &SecretString, provided: &str) -> bool {
    expected
        .expose_secret()
        .as_bytes()
        .ct_eq(provided.as_bytes())
        .into()
}

#[async_trait]
impl Broker for BasicBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
        let header = request
            .header(AUTHORIZATION.as_str())
            .ok_or(AuthError::NotIdentified)?;
        let (user, password) = basic_credentials(header).ok_or(AuthError::NotIdentified)?;

        match self.users.get(&user) {
            Some(expected) if password_matches(expected, &password) => {
                Ok(Identity::new(user, &self.name))
            }
            _ => {
                debug!("basic auth rejected for user {user}");
                Err(AuthError::NotIdentified)
            }
        }
    }

    fn authenticator(&self) -> Option<&dyn Authenticator> {
        Some(self)
    }
}

#[async_trait]
impl Authenticator for BasicBroker {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<BrokerResponse, AuthError> {
        Ok(BrokerResponse::Challenge {
            realm: self.realm.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use axum::http::HeaderMap;
    use std::sync::Arc;
    use url::Url;

    fn broker() -> Result<BasicBroker, String> {
        Ok(BasicBroker::new("basic", parse_users("alice:wonderland,bob:builder")?).with_realm("test"))
    }

    fn request(authorization: Option<&str>) -> Result<AuthRequest, Box<dyn std::error::Error>> {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, value.parse()?);
        }
        Ok(AuthRequest::new(
            Arc::new(Session::new("s1")),
            Url::parse("http://localhost:8080")?,
        )
        .with_headers(headers))
    }

    fn basic(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            Base64::encode_string(format!("{user}:{password}").as_bytes())
        )
    }

    #[test]
    fn passwords_must_match_exactly() {
        let expected = SecretString::from("wonderland");
        assert!(password_matches(&expected, "wonderland"));
        for provided in ["wonder", "wonderland!", "Wonderland", ""] {
            assert!(!password_matches(&expected, provided), "{provided}");
        }
    }

    #[tokio::test]
    async fn correct_credentials_identify_the_user() -> Result<(), Box<dyn std::error::Error>> {
        let broker = broker()?;
        for (user, password) in [("alice", "wonderland"), ("bob", "builder")] {
            let identity = broker
                .identify(&request(Some(&basic(user, password)))?)
                .await?;
            assert_eq!(identity.subject(), user);
            assert_eq!(identity.broker(), "basic");
        }
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_is_not_identified() -> Result<(), Box<dyn std::error::Error>> {
        let result = broker()?
            .identify(&request(Some(&basic("alice", "mirror")))?)
            .await;
        assert!(matches!(result, Err(AuthError::NotIdentified)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_user_is_not_identified() -> Result<(), Box<dyn std::error::Error>> {
        let result = broker()?
            .identify(&request(Some(&basic("mallory", "wonderland")))?)
            .await;
        assert!(matches!(result, Err(AuthError::NotIdentified)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_not_identified(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let broker = broker()?;
        for header in [None, Some("Bearer abc"), Some("Basic !!!"), Some("Basic")] {
            let result = broker.identify(&request(header)?).await;
            assert!(matches!(result, Err(AuthError::NotIdentified)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_issues_a_challenge() -> Result<(), Box<dyn std::error::Error>> {
        let broker = broker()?;
        let authenticator = broker.authenticator().ok_or("no authenticator")?;
        let response = authenticator.authenticate(&request(None)?).await?;
        assert_eq!(
            response,
            BrokerResponse::Challenge {
                realm: "test".to_string()
            }
        );
        assert!(broker.callback_handler().is_none());
        assert!(broker.logouter().is_none());
        Ok(())
    }

    #[test]
    fn parse_users_rejects_entries_without_password() {
        assert!(parse_users("alice").is_err());
        assert!(parse_users(":secret").is_err());
        assert_eq!(parse_users("").map(|users| users.len()), Ok(0));
        assert!(parse_users("alice:a:b")
            .ok()
            .and_then(|users| users.get("alice").map(|p| p.expose_secret() == "a:b"))
            .unwrap_or(false));
    }
}
