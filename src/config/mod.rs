//! Run configuration consumed by the harness.
//!
//! [`ProductionConfig`] is assembled once by the CLI and shared read-only by
//! every component. The protected-environment switch is not ambient state:
//! it is the [`WritePolicy`] value carried here and passed explicitly to every
//! write-capable operation.

mod region;

pub use self::region::{load_regions, RegionDescriptor, RegionRole, REGION_TABLE};

use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use url::Url;

pub const DEFAULT_REGION: &str = "ap-northeast-1";

/// Whether write-capable stages may touch the live backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Writes are short-circuited into a simulated success.
    ReadOnly,
    /// Writes are performed against the backend.
    Live,
}

impl WritePolicy {
    #[must_use]
    pub const fn from_read_only(read_only: bool) -> Self {
        if read_only {
            Self::ReadOnly
        } else {
            Self::Live
        }
    }

    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    /// Gate a write stage. `Some` means the stage must not run and the
    /// returned value stands in for its success.
    #[must_use]
    pub fn simulate(self, stage: &str) -> Option<Simulated> {
        match self {
            Self::ReadOnly => Some(Simulated::new(stage, "simulated: read-only mode")),
            Self::Live => None,
        }
    }

    /// Stages the harness never performs live (resource fetches, failover
    /// drills, token refresh, cross-region claim comparison). Always
    /// simulated; the reason records which policy was in force.
    #[must_use]
    pub fn safeguard(self, stage: &str) -> Simulated {
        match self {
            Self::ReadOnly => Simulated::new(stage, "skipped: read-only mode"),
            Self::Live => Simulated::new(stage, "skipped: protected environment"),
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// A write stage that was deliberately not performed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Simulated {
    pub stage: String,
    pub reason: String,
}

impl Simulated {
    fn new(stage: &str, reason: &str) -> Self {
        Self {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid production configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct ProductionConfig {
    pub region: String,
    pub user_pool_id: String,
    /// Identity-provider endpoint id (the app client id).
    pub client_id: String,
    pub session_table: String,
    pub write_policy: WritePolicy,
    /// Overrides the regional identity-provider URL (signing proxies, tests).
    pub idp_endpoint: Option<Url>,
    /// Overrides the regional session-store URL.
    pub session_store_endpoint: Option<Url>,
}

impl ProductionConfig {
    #[must_use]
    pub fn new(
        region: impl Into<String>,
        user_pool_id: impl Into<String>,
        client_id: impl Into<String>,
        session_table: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            user_pool_id: user_pool_id.into(),
            client_id: client_id.into(),
            session_table: session_table.into(),
            write_policy: WritePolicy::ReadOnly,
            idp_endpoint: None,
            session_store_endpoint: None,
        }
    }

    #[must_use]
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    #[must_use]
    pub fn with_idp_endpoint(mut self, endpoint: Url) -> Self {
        self.idp_endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_session_store_endpoint(mut self, endpoint: Url) -> Self {
        self.session_store_endpoint = Some(endpoint);
        self
    }

    /// Check cross-field invariants. Errors are fatal at start-up, warnings
    /// are only logged.
    #[must_use]
    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if !valid_region(&self.region) {
            report.errors.push(format!("invalid region: {}", self.region));
        }
        if self.user_pool_id.trim().is_empty() {
            report.errors.push("user pool id is not set".to_string());
        }
        if self.client_id.trim().is_empty() {
            report.errors.push("client id is not set".to_string());
        }
        if self.session_table.trim().is_empty() {
            report.errors.push("session table is not set".to_string());
        }
        if self.write_policy == WritePolicy::Live {
            report
                .warnings
                .push("read-only mode is disabled: session writes and sign-outs are live".to_string());
        }

        report
    }
}

pub fn valid_region(region: &str) -> bool {
    Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d$").map_or(false, |re| re.is_match(region))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` listing every error found.
    pub fn into_result(self) -> Result<Vec<String>, ConfigError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ConfigError::Invalid(self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProductionConfig {
        ProductionConfig::new(DEFAULT_REGION, "ap-northeast-1_pool", "client", "sessions")
    }

    #[test]
    fn test_default_policy_is_read_only() {
        assert_eq!(config().write_policy, WritePolicy::ReadOnly);
        assert!(WritePolicy::from_read_only(true).is_read_only());
        assert!(!WritePolicy::from_read_only(false).is_read_only());
    }

    #[test]
    fn test_simulate_only_when_read_only() {
        let simulated = WritePolicy::ReadOnly.simulate("session-create");
        assert_eq!(
            simulated,
            Some(Simulated {
                stage: "session-create".to_string(),
                reason: "simulated: read-only mode".to_string(),
            })
        );
        assert!(WritePolicy::Live.simulate("session-create").is_none());
    }

    #[test]
    fn test_safeguard_always_simulates() {
        assert_eq!(
            WritePolicy::Live.safeguard("resource-access").reason,
            "skipped: protected environment"
        );
        assert_eq!(
            WritePolicy::ReadOnly.safeguard("resource-access").reason,
            "skipped: read-only mode"
        );
    }

    #[test]
    fn test_validate_ok() {
        let report = config().validate();
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validate_reports_every_missing_field() {
        let report = ProductionConfig::new("tokyo", "", " ", "").validate();
        assert_eq!(report.errors.len(), 4);
        let err = report.into_result().unwrap_err().to_string();
        assert!(err.contains("invalid region: tokyo"));
        assert!(err.contains("session table is not set"));
    }

    #[test]
    fn test_validate_warns_on_live_writes() {
        let report = config().with_write_policy(WritePolicy::Live).validate();
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_valid_region() {
        for region in ["ap-northeast-1", "us-east-1", "eu-west-1", "us-gov-west-1"] {
            assert!(valid_region(region), "{region}");
        }
        for region in ["", "tokyo", "ap-northeast", "AP-NORTHEAST-1"] {
            assert!(!valid_region(region), "{region}");
        }
    }
}
