//! RS256 ID token verification against the provider's JWKS.

use super::state::{Clock, SystemClock};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use reqwest::Client;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("rsa error")]
    Rsa(#[from] rsa::errors::Error),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("key fetch failed: {0}")]
    KeyFetch(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Key for `kid`, or the only signing key when the token names none.
    #[must_use]
    pub fn find(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None => {
                let mut rsa_keys = self.keys.iter().filter(|k| k.kty == "RSA");
                match (rsa_keys.next(), rsa_keys.next()) {
                    (Some(key), None) => Some(key),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub e: String,
}

impl Jwk {
    /// Convert this JWK to an `RsaPublicKey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base64url values cannot be decoded or the RSA key is invalid.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, VerifyError> {
        let n_bytes = Base64UrlUnpadded::decode_vec(&self.n).map_err(|_| VerifyError::Base64)?;
        let e_bytes = Base64UrlUnpadded::decode_vec(&self.e).map_err(|_| VerifyError::Base64)?;
        let n = BigUint::from_bytes_be(&n_bytes);
        let e = BigUint::from_bytes_be(&e_bytes);
        Ok(RsaPublicKey::new(n, e)?)
    }
}

#[derive(Debug, Deserialize)]
struct JwtHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(value) => value == audience,
            Self::Many(values) => values.iter().any(|value| value == audience),
        }
    }
}

/// Verified ID token claims.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdTokenClaims {
    /// Look up a claim by name, including the registered ones.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<Value> {
        match name {
            "iss" => Some(Value::String(self.iss.clone())),
            "sub" => Some(Value::String(self.sub.clone())),
            "exp" => Some(Value::from(self.exp)),
            "iat" => self.iat.map(Value::from),
            "aud" => serde_json::to_value(&self.aud).ok(),
            _ => self.extra.get(name).cloned(),
        }
    }
}

#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    async fn verify(&self, raw_id_token: &str) -> Result<IdTokenClaims, VerifyError>;
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, VerifyError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| VerifyError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decode the payload of a JWT without checking its signature.
///
/// Used for access tokens, which are opaque to this client by contract and only
/// mined for claims.
#[must_use]
pub fn decode_unverified(token: &str) -> Option<Map<String, Value>> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    parts.next()?;
    b64d_json(payload).ok()
}

/// Minimum time between two JWKS fetches triggered by unknown key ids.
pub const DEFAULT_REFETCH_INTERVAL: Duration = Duration::from_secs(60);

enum KeySource {
    Static,
    Remote { http: Client, jwks_uri: Url },
}

pub struct JwksVerifier {
    issuer: String,
    audience: String,
    source: KeySource,
    keys: RwLock<Option<Jwks>>,
    last_fetch: Mutex<Option<i64>>,
    refetch_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl JwksVerifier {
    /// Verifier fetching keys from `jwks_uri` on first use and on unknown `kid`.
    #[must_use]
    pub fn remote(
        http: Client,
        jwks_uri: Url,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            source: KeySource::Remote { http, jwks_uri },
            keys: RwLock::new(None),
            last_fetch: Mutex::new(None),
            refetch_interval: DEFAULT_REFETCH_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_keys(jwks: Jwks, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            source: KeySource::Static,
            keys: RwLock::new(Some(jwks)),
            last_fetch: Mutex::new(None),
            refetch_interval: DEFAULT_REFETCH_INTERVAL,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = interval;
        self
    }

    async fn cached_key(&self, kid: Option<&str>) -> Option<Result<RsaPublicKey, VerifyError>> {
        let keys = self.keys.read().await;
        keys.as_ref()?.find(kid).map(Jwk::to_rsa_public_key)
    }

    async fn fetch(&self) -> Result<Option<Jwks>, VerifyError> {
        let KeySource::Remote { http, jwks_uri } = &self.source else {
            return Ok(None);
        };
        debug!("fetching JWKS from {jwks_uri}");
        let response = http
            .get(jwks_uri.clone())
            .send()
            .await
            .map_err(|err| VerifyError::KeyFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(VerifyError::KeyFetch(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        let jwks: Jwks = response
            .json()
            .await
            .map_err(|err| VerifyError::KeyFetch(err.to_string()))?;
        Ok(Some(jwks))
    }

    async fn key_for(&self, kid: Option<&str>) -> Result<RsaPublicKey, VerifyError> {
        if let Some(key) = self.cached_key(kid).await {
            return key;
        }

        // Unknown key: the provider may have rotated. One fetch per interval.
        let mut last_fetch = self.last_fetch.lock().await;
        if let Some(key) = self.cached_key(kid).await {
            return key;
        }
        let now = self.clock.now_unix();
        let interval = i64::try_from(self.refetch_interval.as_secs()).unwrap_or(i64::MAX);
        if last_fetch.is_some_and(|at| now.saturating_sub(at) < interval) {
            debug!("skipping JWKS refetch for unknown kid {kid:?}");
            return Err(VerifyError::UnknownKid(kid.unwrap_or("none").to_string()));
        }
        *last_fetch = Some(now);

        if let Some(jwks) = self.fetch().await? {
            let key = jwks.find(kid).map(Jwk::to_rsa_public_key);
            *self.keys.write().await = Some(jwks);
            if let Some(key) = key {
                return key;
            }
        }
        Err(VerifyError::UnknownKid(kid.unwrap_or("none").to_string()))
    }
}

#[async_trait]
impl IdTokenVerifier for JwksVerifier {
    async fn verify(&self, raw_id_token: &str) -> Result<IdTokenClaims, VerifyError> {
        let mut parts = raw_id_token.split('.');
        let header_b64 = parts.next().ok_or(VerifyError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(VerifyError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(VerifyError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(VerifyError::TokenFormat);
        }

        let header: JwtHeader = b64d_json(header_b64)?;
        if header.alg != "RS256" {
            return Err(VerifyError::UnsupportedAlg(header.alg));
        }

        let public_key = self.key_for(header.kid.as_deref()).await?;
        let verifying_key = VerifyingKey::<Sha256>::new(public_key);
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_bytes =
            Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| VerifyError::Base64)?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|_| VerifyError::InvalidSignature)?;
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        let claims: IdTokenClaims = b64d_json(claims_b64)?;
        if claims.iss.trim_end_matches('/') != self.issuer.trim_end_matches('/') {
            return Err(VerifyError::InvalidIssuer);
        }
        if !claims.aud.contains(&self.audience) {
            return Err(VerifyError::InvalidAudience);
        }
        if claims.exp <= self.clock.now_unix() {
            return Err(VerifyError::Expired);
        }

        Ok(claims)
    }
}
