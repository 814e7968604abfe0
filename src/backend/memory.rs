//! Scripted in-memory backend.
//!
//! Behaves like a small user pool: known users authenticate with their
//! password, tokens resolve back to their user, and every call is recorded so
//! tests can assert which operations reached the backend.

use super::{AuthResponse, BackendError, IdentityProvider, SessionRecord, SessionStore, UserInfo};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct MemoryUser {
    username: String,
    password: String,
    groups: Vec<String>,
    attributes: BTreeMap<String, String>,
    challenge: Option<String>,
    withhold_token: bool,
}

impl MemoryUser {
    #[must_use]
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    /// Answer `InitiateAuth` with this challenge instead of tokens.
    #[must_use]
    pub fn with_challenge(mut self, challenge: &str) -> Self {
        self.challenge = Some(challenge.to_string());
        self
    }

    /// Answer `InitiateAuth` with HTTP success but no access token.
    #[must_use]
    pub fn without_token(mut self) -> Self {
        self.withhold_token = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct MemoryIdentityProvider {
    region: String,
    users: HashMap<String, MemoryUser>,
    unavailable: bool,
    transient_failures: AtomicUsize,
    latency: Duration,
    calls: Mutex<Vec<String>>,
}

impl MemoryIdentityProvider {
    #[must_use]
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: MemoryUser) -> Self {
        self.users.insert(user.username.clone(), user);
        self
    }

    /// Every call fails with a transport error.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// The next `count` calls fail with a transport error.
    #[must_use]
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Delay applied before every `InitiateAuth` answer.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Operations received so far, as `Operation:subject`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(':').next() == Some(operation))
            .count()
    }

    fn record(&self, operation: &str, subject: &str) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{operation}:{subject}"));

        if self.unavailable {
            return Err(BackendError::Transport(format!("{} is unavailable", self.region)));
        }

        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BackendError::Transport("connection reset".to_string()));
        }

        Ok(())
    }

    fn user_for_token(&self, access_token: &SecretString) -> Result<&MemoryUser, BackendError> {
        access_token
            .expose_secret()
            .strip_prefix("access-")
            .and_then(|name| self.users.get(name))
            .ok_or_else(|| BackendError::Rejected {
                code: "NotAuthorizedException".to_string(),
                message: "Invalid Access Token".to_string(),
            })
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    fn region(&self) -> &str {
        &self.region
    }

    async fn initiate_auth(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<AuthResponse, BackendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.record("InitiateAuth", username)?;

        let user = self
            .users
            .get(username)
            .filter(|user| user.password == password.expose_secret())
            .ok_or_else(|| BackendError::Rejected {
                code: "NotAuthorizedException".to_string(),
                message: "Incorrect username or password.".to_string(),
            })?;

        if let Some(challenge) = &user.challenge {
            return Ok(AuthResponse {
                challenge_name: Some(challenge.clone()),
                ..AuthResponse::default()
            });
        }

        if user.withhold_token {
            return Ok(AuthResponse::default());
        }

        Ok(AuthResponse {
            access_token: Some(SecretString::from(format!("access-{username}"))),
            id_token: Some(SecretString::from(format!("id-{username}"))),
            refresh_token: Some(SecretString::from(format!("refresh-{username}"))),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            challenge_name: None,
        })
    }

    async fn get_user(&self, access_token: &SecretString) -> Result<UserInfo, BackendError> {
        self.record("GetUser", "token")?;
        let user = self.user_for_token(access_token)?;
        Ok(UserInfo {
            username: user.username.clone(),
            attributes: user.attributes.clone(),
        })
    }

    async fn list_groups_for_user(&self, username: &str) -> Result<Vec<String>, BackendError> {
        self.record("AdminListGroupsForUser", username)?;
        self.users
            .get(username)
            .map(|user| user.groups.clone())
            .ok_or_else(|| BackendError::Rejected {
                code: "UserNotFoundException".to_string(),
                message: "User does not exist.".to_string(),
            })
    }

    async fn global_sign_out(&self, access_token: &SecretString) -> Result<(), BackendError> {
        self.record("GlobalSignOut", "token")?;
        self.user_for_token(access_token).map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    writes: Mutex<Vec<SessionRecord>>,
    failure: Option<BackendError>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with `error`.
    #[must_use]
    pub fn failing(error: BackendError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn writes(&self) -> Vec<SessionRecord> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), BackendError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn test_tokens_resolve_to_user() {
        let idp = MemoryIdentityProvider::new("ap-northeast-1").with_user(
            MemoryUser::new("testuser", "pw")
                .with_groups(&["users"])
                .with_attribute("sid", "S-1"),
        );

        let auth = idp.initiate_auth("testuser", &secret("pw")).await.unwrap();
        let token = auth.access_token.unwrap();
        let user = idp.get_user(&token).await.unwrap();
        assert_eq!(user.username, "testuser");
        assert_eq!(user.attribute("sid"), Some("S-1"));

        assert!(idp.initiate_auth("testuser", &secret("bad")).await.unwrap_err().is_rejection());
        assert_eq!(idp.count("InitiateAuth"), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let idp = MemoryIdentityProvider::new("ap-northeast-1")
            .with_user(MemoryUser::new("testuser", "pw"))
            .with_transient_failures(2);

        assert!(idp.initiate_auth("testuser", &secret("pw")).await.unwrap_err().is_transient());
        assert!(idp.initiate_auth("testuser", &secret("pw")).await.unwrap_err().is_transient());
        assert!(idp.initiate_auth("testuser", &secret("pw")).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_records_writes() {
        let store = MemorySessionStore::new();
        let now = chrono::Utc::now();
        let record = SessionRecord {
            session_id: "s".to_string(),
            identity_name: "testuser".to_string(),
            created_at: now,
            expires_at: now,
            active: true,
        };
        store.put_session(&record).await.unwrap();
        assert_eq!(store.writes(), vec![record]);
    }
}
