//! Clients for the two external services the harness probes: the identity
//! provider and the session store.
//!
//! Both are consumed through object-safe traits so the probes can run against
//! the live AWS JSON APIs ([`cognito`], [`dynamo`]) or a scripted in-memory
//! backend ([`memory`]).

pub mod cognito;
pub mod dynamo;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection failure, timeout or a 5xx from the service.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service refused the credential or token.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
    /// Non-retryable 4xx that is not a credential rejection.
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether a later attempt could reasonably succeed: transport failures
    /// and truncated or undecodable bodies.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Malformed(_))
    }

    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result of `InitiateAuth`. Either tokens or a challenge, never both in a
/// well-behaved response; the probe decides what a missing token means.
#[derive(Debug, Default)]
pub struct AuthResponse {
    pub access_token: Option<SecretString>,
    pub id_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub challenge_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub attributes: BTreeMap<String, String>,
}

impl UserInfo {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A session row as written to the session store. Never carries the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub identity_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Region this client talks to.
    fn region(&self) -> &str;

    /// # Errors
    /// Returns `BackendError::Rejected` when the credential is refused.
    async fn initiate_auth(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<AuthResponse, BackendError>;

    /// # Errors
    /// Returns `BackendError` if the token is refused or the call fails.
    async fn get_user(&self, access_token: &SecretString) -> Result<UserInfo, BackendError>;

    /// # Errors
    /// Returns `BackendError` if the call fails.
    async fn list_groups_for_user(&self, username: &str) -> Result<Vec<String>, BackendError>;

    /// # Errors
    /// Returns `BackendError` if the call fails.
    async fn global_sign_out(&self, access_token: &SecretString) -> Result<(), BackendError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// # Errors
    /// Returns `BackendError` if the write fails.
    async fn put_session(&self, record: &SessionRecord) -> Result<(), BackendError>;
}

/// Regional identity-provider URL unless an override is configured.
///
/// # Errors
/// Returns `BackendError::Malformed` if the region produces an invalid URL.
pub fn idp_endpoint(region: &str, endpoint: Option<&Url>) -> Result<Url, BackendError> {
    resolve_endpoint("cognito-idp", region, endpoint)
}

/// Regional session-store URL unless an override is configured.
///
/// # Errors
/// Returns `BackendError::Malformed` if the region produces an invalid URL.
pub fn session_store_endpoint(region: &str, endpoint: Option<&Url>) -> Result<Url, BackendError> {
    resolve_endpoint("dynamodb", region, endpoint)
}

fn resolve_endpoint(service: &str, region: &str, endpoint: Option<&Url>) -> Result<Url, BackendError> {
    match endpoint {
        Some(url) => Ok(url.clone()),
        None => Url::parse(&format!("https://{service}.{region}.amazonaws.com/"))
            .map_err(|e| BackendError::Malformed(format!("endpoint for region {region}: {e}"))),
    }
}

/// Shared HTTP client for every backend.
///
/// # Errors
/// Returns `BackendError::Transport` if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .build()
        .map_err(|e| BackendError::Transport(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_regional_endpoints() {
        let url = idp_endpoint("ap-northeast-3", None).unwrap();
        assert_eq!(url.as_str(), "https://cognito-idp.ap-northeast-3.amazonaws.com/");

        let url = session_store_endpoint("eu-west-1", None).unwrap();
        assert_eq!(url.as_str(), "https://dynamodb.eu-west-1.amazonaws.com/");
    }

    #[test]
    fn test_endpoint_override() {
        let proxy = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(idp_endpoint("us-east-1", Some(&proxy)).unwrap(), proxy);
    }

    #[test]
    fn test_error_classification() {
        assert!(BackendError::Transport("reset".into()).is_transient());
        assert!(BackendError::Malformed("truncated body".into()).is_transient());
        assert!(!BackendError::Status {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        let rejected = BackendError::Rejected {
            code: "NotAuthorizedException".into(),
            message: "Incorrect username or password.".into(),
        };
        assert!(rejected.is_rejection());
        assert!(!rejected.is_transient());
        assert_eq!(
            rejected.to_string(),
            "NotAuthorizedException: Incorrect username or password."
        );
    }
}
