//! MFA challenge check.
//!
//! There is no automated source of second-factor codes, so the check stops at
//! the challenge: `mfa_completed` is set as soon as the provider names a
//! challenge, NOT when the challenge is answered. A passing check says the
//! pool demands a second factor for this identity; it does not say the
//! identity ends up fully authenticated.

use super::{AuthDetails, AuthenticationProbe, ProbeError, ProbeOutcome};
use crate::fixtures::IdentityFixture;
use serde::Serialize;
use tracing::{info, instrument};

pub const NOT_MFA_ENABLED: &str = "skipped: identity is not MFA-enabled";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MfaDetails {
    pub mfa_required: bool,
    /// Challenge observed, not solved.
    pub mfa_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_type: Option<String>,
}

impl MfaDetails {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.mfa_required
    }
}

#[derive(Debug)]
pub enum MfaCheck {
    Skipped(String),
    Checked { mfa: MfaDetails, auth: AuthDetails },
}

/// # Errors
/// Returns `ProbeError` when the sign-in attempt fails at the transport level.
#[instrument(skip(probe, identity), fields(identity = %identity.name))]
pub async fn check_mfa(probe: &AuthenticationProbe, identity: &IdentityFixture) -> Result<MfaCheck, ProbeError> {
    if !identity.mfa_enabled {
        return Ok(MfaCheck::Skipped(NOT_MFA_ENABLED.to_string()));
    }

    let outcome = match probe.authenticate(identity).await? {
        ProbeOutcome::Skipped(reason) => return Ok(MfaCheck::Skipped(reason)),
        ProbeOutcome::Attempted(outcome) => outcome,
    };

    let challenge_type = outcome.mfa_challenge().map(str::to_string);
    if let Some(challenge) = &challenge_type {
        info!("MFA challenge requested: {challenge}");
    }

    let mfa = MfaDetails {
        mfa_required: challenge_type.is_some(),
        mfa_completed: challenge_type.is_some(),
        challenge_type,
    };

    Ok(MfaCheck::Checked {
        mfa,
        auth: outcome.details(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryIdentityProvider, MemoryUser};
    use std::sync::Arc;

    fn probe() -> AuthenticationProbe {
        AuthenticationProbe::new(Arc::new(
            MemoryIdentityProvider::new("ap-northeast-1")
                .with_user(MemoryUser::new("test-user-2", "pw").with_challenge("SOFTWARE_TOKEN_MFA"))
                .with_user(MemoryUser::new("test-user-1", "pw")),
        ))
    }

    #[tokio::test]
    async fn test_not_enabled_is_skipped() {
        let identity = IdentityFixture::new("test-user-1").with_secret(Some("pw".into()));
        let check = check_mfa(&probe(), &identity).await.unwrap();
        assert!(matches!(check, MfaCheck::Skipped(reason) if reason == NOT_MFA_ENABLED));
    }

    #[tokio::test]
    async fn test_missing_credential_is_skipped() {
        let identity = IdentityFixture::new("test-user-2").with_mfa(true);
        let check = check_mfa(&probe(), &identity).await.unwrap();
        assert!(matches!(check, MfaCheck::Skipped(_)));
    }

    #[tokio::test]
    async fn test_challenge_marks_completed() {
        let identity = IdentityFixture::new("test-user-2")
            .with_secret(Some("pw".into()))
            .with_mfa(true);
        let MfaCheck::Checked { mfa, .. } = check_mfa(&probe(), &identity).await.unwrap() else {
            panic!("expected a checked result");
        };
        assert!(mfa.succeeded());
        assert!(mfa.mfa_completed);
        assert_eq!(mfa.challenge_type.as_deref(), Some("SOFTWARE_TOKEN_MFA"));
    }

    #[tokio::test]
    async fn test_no_challenge_fails() {
        let identity = IdentityFixture::new("test-user-1")
            .with_secret(Some("pw".into()))
            .with_mfa(true);
        let MfaCheck::Checked { mfa, auth } = check_mfa(&probe(), &identity).await.unwrap() else {
            panic!("expected a checked result");
        };
        assert!(!mfa.succeeded());
        assert!(!mfa.mfa_completed);
        assert!(auth.access_token.is_some());
    }
}
