//! Session lifecycle: create, validate, terminate.
//!
//! Each stage is attempted independently and reported on its own, so a run
//! that fails validation still shows whether creation and sign-out worked.

use super::AuthenticationOutcome;
use crate::backend::{IdentityProvider, SessionRecord, SessionStore};
use crate::config::WritePolicy;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const SESSION_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Create,
    Validate,
    Terminate,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "session-create"),
            Self::Validate => write!(f, "session-validate"),
            Self::Terminate => write!(f, "session-terminate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: SessionStage,
    pub success: bool,
    /// Set when the stage was simulated instead of performed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    fn passed(stage: SessionStage) -> Self {
        Self {
            stage,
            success: true,
            simulated: None,
            error: None,
        }
    }

    fn simulated(stage: SessionStage, reason: String) -> Self {
        Self {
            stage,
            success: true,
            simulated: Some(reason),
            error: None,
        }
    }

    fn failed(stage: SessionStage, error: impl fmt::Display) -> Self {
        Self {
            stage,
            success: false,
            simulated: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub session_created: bool,
    pub session_valid: bool,
    pub session_terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub stages: Vec<StageReport>,
}

impl SessionDetails {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.session_created && self.session_valid && self.session_terminated
    }

    /// `"<stage>: <error>"` for every failed stage.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|stage| !stage.success)
            .map(|stage| format!("{}: {}", stage.stage, stage.error.as_deref().unwrap_or("failed")))
            .collect()
    }

    fn push(&mut self, report: StageReport) {
        match report.stage {
            SessionStage::Create => self.session_created = report.success,
            SessionStage::Validate => self.session_valid = report.success,
            SessionStage::Terminate => self.session_terminated = report.success,
        }
        self.stages.push(report);
    }
}

#[derive(Clone)]
pub struct SessionLifecycle {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
}

impl SessionLifecycle {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, store: Arc<dyn SessionStore>) -> Self {
        Self { provider, store }
    }

    /// Write a session record for `identity`, or simulate it under
    /// `WritePolicy::ReadOnly`.
    #[instrument(skip(self), fields(identity = %identity))]
    pub async fn create(&self, identity: &str, policy: WritePolicy) -> (StageReport, SessionRecord) {
        let created_at = Utc::now();
        let record = SessionRecord {
            session_id: format!("session-{}", Uuid::new_v4()),
            identity_name: identity.to_string(),
            created_at,
            expires_at: created_at + Duration::hours(SESSION_TTL_HOURS),
            active: true,
        };

        if let Some(simulated) = policy.simulate(&SessionStage::Create.to_string()) {
            info!("{}: {}", simulated.stage, simulated.reason);
            return (StageReport::simulated(SessionStage::Create, simulated.reason), record);
        }

        let report = match self.store.put_session(&record).await {
            Ok(()) => StageReport::passed(SessionStage::Create),
            Err(e) => {
                warn!("session create failed: {e}");
                StageReport::failed(SessionStage::Create, e)
            }
        };

        (report, record)
    }

    /// Re-query the provider with the token; a non-empty username is required.
    /// Read-only, so it runs under every policy.
    #[instrument(skip(self, access_token))]
    pub async fn validate(&self, access_token: &SecretString) -> (StageReport, Option<String>) {
        match self.provider.get_user(access_token).await {
            Ok(user) if !user.username.is_empty() => {
                (StageReport::passed(SessionStage::Validate), Some(user.username))
            }
            Ok(_) => (
                StageReport::failed(SessionStage::Validate, "provider returned an empty username"),
                None,
            ),
            Err(e) => {
                warn!("session validate failed: {e}");
                (StageReport::failed(SessionStage::Validate, e), None)
            }
        }
    }

    /// Global sign-out, or its simulation under `WritePolicy::ReadOnly`.
    #[instrument(skip(self, access_token))]
    pub async fn terminate(&self, access_token: &SecretString, policy: WritePolicy) -> StageReport {
        if let Some(simulated) = policy.simulate(&SessionStage::Terminate.to_string()) {
            info!("{}: {}", simulated.stage, simulated.reason);
            return StageReport::simulated(SessionStage::Terminate, simulated.reason);
        }

        match self.provider.global_sign_out(access_token).await {
            Ok(()) => StageReport::passed(SessionStage::Terminate),
            Err(e) => {
                warn!("session terminate failed: {e}");
                StageReport::failed(SessionStage::Terminate, e)
            }
        }
    }

    /// Run all three stages for an authenticated outcome. Without an access
    /// token every stage fails.
    pub async fn run(&self, outcome: &AuthenticationOutcome, policy: WritePolicy) -> SessionDetails {
        let mut details = SessionDetails::default();

        let Some(token) = outcome.access_token.as_ref() else {
            for stage in [SessionStage::Create, SessionStage::Validate, SessionStage::Terminate] {
                details.push(StageReport::failed(stage, "no access token"));
            }
            return details;
        };

        let (created, record) = self.create(&outcome.identity, policy).await;
        if created.success {
            details.session_id = Some(record.session_id);
            details.expires_at = Some(record.expires_at);
        }
        details.push(created);

        let (validated, username) = self.validate(token).await;
        details.username = username;
        details.push(validated);

        details.push(self.terminate(token, policy).await);

        details
    }
}
