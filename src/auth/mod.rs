//! Authentication probe and the validators layered on top of it.
//!
//! A probe is bound to one regional identity provider; "authenticate against
//! region R" means building the probe from R's provider (see
//! [`region::RegionPool`]).

pub mod mfa;
pub mod region;
pub mod session;
pub mod sid;

use crate::backend::{BackendError, IdentityProvider};
use crate::fixtures::IdentityFixture;
use secrecy::SecretString;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

pub const MASKED: &str = "[MASKED]";

/// Reason recorded when an identity has no credential configured.
pub const NO_CREDENTIAL: &str = "skipped: no credential configured";

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The provider failed for a reason other than refusing the credential.
    #[error("{region}: {source}")]
    Backend {
        region: String,
        #[source]
        source: BackendError,
    },
}

impl ProbeError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.is_transient(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AuthStatus {
    /// Tokens were issued.
    Authenticated,
    /// The provider asked for a further step (MFA, new password).
    Challenged(String),
    /// The provider refused the credential.
    Rejected(String),
    /// The call succeeded but carried no access token.
    MissingToken,
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => write!(f, "authenticated"),
            Self::Challenged(challenge) => write!(f, "challenged ({challenge})"),
            Self::Rejected(reason) => write!(f, "rejected ({reason})"),
            Self::MissingToken => write!(f, "no access token issued"),
        }
    }
}

#[derive(Debug)]
pub struct AuthenticationOutcome {
    pub identity: String,
    pub region: String,
    pub status: AuthStatus,
    pub access_token: Option<SecretString>,
    pub id_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub latency: Duration,
}

impl AuthenticationOutcome {
    /// Only an issued access token counts as success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    #[must_use]
    pub fn mfa_challenge(&self) -> Option<&str> {
        match &self.status {
            AuthStatus::Challenged(name) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }

    /// Report-safe view; tokens are reduced to `[MASKED]` markers.
    #[must_use]
    pub fn details(&self) -> AuthDetails {
        let mask = |token: &Option<SecretString>| token.as_ref().map(|_| MASKED.to_string());
        AuthDetails {
            identity: self.identity.clone(),
            region: self.region.clone(),
            status: self.status.clone(),
            latency_ms: self.latency_ms(),
            access_token: mask(&self.access_token),
            id_token: mask(&self.id_token),
            refresh_token: mask(&self.refresh_token),
            token_type: self.token_type.clone(),
            expires_in: self.expires_in,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthDetails {
    pub identity: String,
    pub region: String,
    pub status: AuthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

#[derive(Debug)]
pub enum ProbeOutcome {
    /// No network call was made.
    Skipped(String),
    Attempted(AuthenticationOutcome),
}

#[derive(Clone)]
pub struct AuthenticationProbe {
    provider: Arc<dyn IdentityProvider>,
}

impl AuthenticationProbe {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    #[must_use]
    pub fn region(&self) -> &str {
        self.provider.region()
    }

    /// Attempt one sign-in for `identity`.
    ///
    /// # Errors
    /// Returns `ProbeError` for transport, status and malformed-response
    /// failures. A refused credential is an `Attempted` outcome with
    /// `AuthStatus::Rejected`, not an error.
    #[instrument(skip(self, identity), fields(identity = %identity.name, region = %self.region()))]
    pub async fn authenticate(&self, identity: &IdentityFixture) -> Result<ProbeOutcome, ProbeError> {
        let Some(secret) = identity.secret.as_ref() else {
            debug!("no credential for {}", identity.name);
            return Ok(ProbeOutcome::Skipped(NO_CREDENTIAL.to_string()));
        };

        let started = Instant::now();
        let response = self.provider.initiate_auth(&identity.name, secret).await;
        let latency = started.elapsed();

        let mut outcome = AuthenticationOutcome {
            identity: identity.name.clone(),
            region: self.region().to_string(),
            status: AuthStatus::MissingToken,
            access_token: None,
            id_token: None,
            refresh_token: None,
            token_type: None,
            expires_in: None,
            latency,
        };

        match response {
            Ok(response) => {
                outcome.status = match (&response.challenge_name, &response.access_token) {
                    (Some(challenge), _) => AuthStatus::Challenged(challenge.clone()),
                    (None, Some(_)) => AuthStatus::Authenticated,
                    (None, None) => AuthStatus::MissingToken,
                };
                outcome.access_token = response.access_token;
                outcome.id_token = response.id_token;
                outcome.refresh_token = response.refresh_token;
                outcome.token_type = response.token_type;
                outcome.expires_in = response.expires_in;
            }
            Err(BackendError::Rejected { code, message }) => {
                outcome.status = AuthStatus::Rejected(format!("{code}: {message}"));
            }
            Err(source) => {
                return Err(ProbeError::Backend {
                    region: self.region().to_string(),
                    source,
                });
            }
        }

        info!(
            "{} in {}: {} ({} ms)",
            outcome.identity,
            outcome.region,
            outcome.status,
            outcome.latency_ms()
        );

        Ok(ProbeOutcome::Attempted(outcome))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryIdentityProvider, MemoryUser};

    fn probe(provider: MemoryIdentityProvider) -> (AuthenticationProbe, Arc<MemoryIdentityProvider>) {
        let provider = Arc::new(provider);
        (AuthenticationProbe::new(provider.clone()), provider)
    }

    fn attempted(outcome: ProbeOutcome) -> AuthenticationOutcome {
        match outcome {
            ProbeOutcome::Attempted(outcome) => outcome,
            ProbeOutcome::Skipped(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_skips_without_network() {
        let (probe, provider) = probe(MemoryIdentityProvider::new("ap-northeast-1"));
        let outcome = probe.authenticate(&IdentityFixture::new("testuser")).await.unwrap();
        assert!(matches!(outcome, ProbeOutcome::Skipped(reason) if reason == NO_CREDENTIAL));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_authenticated() {
        let (probe, _) = probe(
            MemoryIdentityProvider::new("ap-northeast-1").with_user(MemoryUser::new("testuser", "pw")),
        );
        let identity = IdentityFixture::new("testuser").with_secret(Some("pw".into()));
        let outcome = attempted(probe.authenticate(&identity).await.unwrap());
        assert!(outcome.succeeded());
        assert_eq!(outcome.region, "ap-northeast-1");

        let details = outcome.details();
        assert_eq!(details.access_token.as_deref(), Some(MASKED));
        assert_eq!(details.token_type.as_deref(), Some("Bearer"));
    }

    #[tokio::test]
    async fn test_missing_token_is_failure() {
        let (probe, _) = probe(
            MemoryIdentityProvider::new("ap-northeast-1")
                .with_user(MemoryUser::new("testuser", "pw").without_token()),
        );
        let identity = IdentityFixture::new("testuser").with_secret(Some("pw".into()));
        let outcome = attempted(probe.authenticate(&identity).await.unwrap());
        assert_eq!(outcome.status, AuthStatus::MissingToken);
        assert!(!outcome.succeeded());
        assert!(outcome.details().access_token.is_none());
    }

    #[tokio::test]
    async fn test_rejection_is_an_outcome() {
        let (probe, _) = probe(
            MemoryIdentityProvider::new("ap-northeast-1").with_user(MemoryUser::new("testuser", "pw")),
        );
        let identity = IdentityFixture::new("testuser").with_secret(Some("InvalidPassword123!".into()));
        let outcome = attempted(probe.authenticate(&identity).await.unwrap());
        assert!(matches!(outcome.status, AuthStatus::Rejected(_)));
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_challenge_is_not_success() {
        let (probe, _) = probe(
            MemoryIdentityProvider::new("ap-northeast-1")
                .with_user(MemoryUser::new("mfa", "pw").with_challenge("SMS_MFA")),
        );
        let identity = IdentityFixture::new("mfa").with_secret(Some("pw".into()));
        let outcome = attempted(probe.authenticate(&identity).await.unwrap());
        assert_eq!(outcome.mfa_challenge(), Some("SMS_MFA"));
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let (probe, _) = probe(MemoryIdentityProvider::new("us-east-1").unavailable());
        let identity = IdentityFixture::new("testuser").with_secret(Some("pw".into()));
        let err = probe.authenticate(&identity).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("us-east-1: "));
    }
}
