//! Pick-a-user broker for local environments and integration tests.

use super::{
    AuthError, AuthRequest, Authenticator, Broker, BrokerResponse, CallbackHandler, Identity,
    Logouter, CALLBACK_PATH,
};
use async_trait::async_trait;
use std::fmt::Write as _;
use tracing::info;
use url::Url;

pub struct StaticBroker {
    name: String,
    users: Vec<String>,
    session_key: String,
}

impl StaticBroker {
    #[must_use]
    pub fn new(name: impl Into<String>, users: Vec<String>) -> Self {
        let name = name.into();
        let session_key = format!("auth.static.{name}.identity");
        Self {
            name,
            users,
            session_key,
        }
    }

    #[must_use]
    pub fn users(&self) -> &[String] {
        &self.users
    }
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl Broker for StaticBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn identify(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
        request
            .session()
            .get::<Identity>(&self.session_key)
            .await
            .ok_or(AuthError::NotIdentified)
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
}

#[async_trait]
impl Authenticator for StaticBroker {
    async fn authenticate(&self, request: &AuthRequest) -> Result<BrokerResponse, AuthError> {
        let callback = request.url_for(&format!("{CALLBACK_PATH}/{}", self.name))?;

        let mut page = String::from(
            "<!DOCTYPE html>\n<html><head><title>Sign in</title></head><body>\n<h1>Choose a user</h1>\n<ul>\n",
        );
        for user in &self.users {
            let mut link = callback.clone();
            link.query_pairs_mut().append_pair("user", user);
            // writing into a String cannot fail
            let _ = writeln!(
                page,
                "<li><a href=\"{}\">{}</a></li>",
                escape_html(link.as_str()),
                escape_html(user)
            );
        }
        page.push_str("</ul>\n</body></html>\n");

        Ok(BrokerResponse::Page(page))
    }
}

#[async_trait]
impl CallbackHandler for StaticBroker {
    async fn callback(
        &self,
        request: &AuthRequest,
        return_to: &str,
    ) -> Result<BrokerResponse, AuthError> {
        let user = request
            .query_param("user")
            .filter(|user| !user.is_empty())
            .ok_or_else(|| AuthError::InvalidRequest("missing user".to_string()))?;
        if !self.users.iter().any(|known| known == user) {
            return Err(AuthError::InvalidRequest(format!("unknown user: {user}")));
        }

        let identity = Identity::new(user, &self.name);
        request
            .session()
            .insert(&self.session_key, &identity)
            .await?;
        info!("static broker {} signed in {user}", self.name);

        Ok(BrokerResponse::redirect(return_to))
    }
}

#[async_trait]
impl Logouter for StaticBroker {
    async fn logout(&self, request: &AuthRequest) -> Result<Option<Url>, AuthError> {
        request.session().remove(&self.session_key).await;
        Ok(None)
    }
}
