//! SID and permission validation for an authenticated identity.
//!
//! Checks are independent and each reports its own reason, so a report can
//! say "missing permissions: admin, delete" instead of just "invalid".

use super::AuthenticationOutcome;
use crate::backend::IdentityProvider;
use crate::config::WritePolicy;
use crate::fixtures::{FixtureKind, IdentityFixture};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const ELEVATED_GROUP: &str = "administrators";

/// User attributes that may carry the SID, in lookup order.
pub const SID_ATTRIBUTES: [&str; 2] = ["custom:sid", "sid"];

/// Static group to permission table.
pub const GROUP_PERMISSIONS: [(&str, &[&str]); 4] = [
    ("users", &["read", "chat"]),
    ("basic-access", &["write"]),
    ("administrators", &["admin", "delete", "manage"]),
    ("numbered-users", &[]),
];

/// Union of the permissions granted by `groups`. Unknown groups grant nothing.
#[must_use]
pub fn map_groups_to_permissions<S: AsRef<str>>(groups: &[S]) -> BTreeSet<String> {
    groups
        .iter()
        .filter_map(|group| {
            GROUP_PERMISSIONS
                .iter()
                .find(|(name, _)| *name == group.as_ref())
                .map(|(_, permissions)| *permissions)
        })
        .flatten()
        .map(|permission| (*permission).to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Identity,
    Permissions,
    ResourceAccess,
    Elevated,
    FullResourceAccess,
    UserSpecific,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Permissions => "permissions",
            Self::ResourceAccess => "resource-access",
            Self::Elevated => "elevated-privilege",
            Self::FullResourceAccess => "full-resource-access",
            Self::UserSpecific => "user-specific-access",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// What was actually observed (SID, derived permissions, resources).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observed: Vec<String>,
}

impl CheckResult {
    fn pass(check: CheckKind, observed: Vec<String>) -> Self {
        Self {
            check,
            valid: true,
            reason: None,
            observed,
        }
    }

    fn fail(check: CheckKind, reason: impl Into<String>) -> Self {
        Self {
            check,
            valid: false,
            reason: Some(reason.into()),
            observed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SidDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_sid: Option<String>,
    pub expected_groups: BTreeSet<String>,
    pub expected_permissions: BTreeSet<String>,
    pub expected_resource_access: BTreeSet<String>,
    pub checks: Vec<CheckResult>,
}

impl SidDetails {
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|check| check.valid)
    }

    /// `"<check>: <reason>"` for each failed check, joined by `"; "`.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        let failures: Vec<String> = self
            .checks
            .iter()
            .filter(|check| !check.valid)
            .map(|check| format!("{}: {}", check.check, check.reason.as_deref().unwrap_or("invalid")))
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}

#[derive(Clone)]
pub struct SidValidator {
    provider: Arc<dyn IdentityProvider>,
}

impl SidValidator {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// Run the checks that apply to the identity's kind: standard identities
    /// get identity, permission and resource-access checks; admins the
    /// elevated-privilege and full-resource checks; numbered users the
    /// user-specific check.
    #[instrument(skip_all, fields(identity = %identity.name))]
    pub async fn validate(
        &self,
        identity: &IdentityFixture,
        outcome: &AuthenticationOutcome,
        policy: WritePolicy,
    ) -> SidDetails {
        let mut details = SidDetails {
            expected_sid: identity.sid.clone(),
            expected_groups: identity.expected_groups.clone(),
            expected_permissions: identity.expected_permissions.clone(),
            expected_resource_access: identity.expected_resource_access.clone(),
            checks: Vec::new(),
        };

        let kinds: &[CheckKind] = match identity.kind {
            FixtureKind::Standard => &[CheckKind::Identity, CheckKind::Permissions, CheckKind::ResourceAccess],
            FixtureKind::Admin => &[CheckKind::Elevated, CheckKind::FullResourceAccess],
            FixtureKind::Numbered(_) => &[CheckKind::UserSpecific],
        };

        if !outcome.succeeded() {
            details.checks = kinds
                .iter()
                .map(|kind| CheckResult::fail(*kind, "no access token"))
                .collect();
            return details;
        }

        let mut groups: Option<Result<Vec<String>, String>> = None;
        for kind in kinds {
            let check = match kind {
                CheckKind::Identity => self.identity_check(identity, outcome).await,
                CheckKind::Permissions => {
                    match self.groups(&mut groups, &identity.name).await {
                        Ok(list) => permission_check(identity, list),
                        Err(e) => CheckResult::fail(*kind, e),
                    }
                }
                CheckKind::ResourceAccess => resource_access_check(identity, policy),
                CheckKind::Elevated | CheckKind::FullResourceAccess => {
                    match self.groups(&mut groups, &identity.name).await {
                        Ok(list) => elevated_check(*kind, list),
                        Err(e) => CheckResult::fail(*kind, e),
                    }
                }
                CheckKind::UserSpecific => user_specific_check(identity),
            };
            debug!("{}: valid = {}", check.check, check.valid);
            details.checks.push(check);
        }

        details
    }

    /// Group memberships, fetched once per validation.
    async fn groups<'a>(
        &self,
        cache: &'a mut Option<Result<Vec<String>, String>>,
        username: &str,
    ) -> Result<&'a [String], String> {
        if cache.is_none() {
            let fetched = self
                .provider
                .list_groups_for_user(username)
                .await
                .map_err(|e| format!("group lookup failed: {e}"));
            *cache = Some(fetched);
        }
        match cache {
            Some(Ok(groups)) => Ok(groups.as_slice()),
            Some(Err(e)) => Err(e.clone()),
            None => Err("group lookup failed".to_string()),
        }
    }

    /// Exact comparison of the provider's SID attribute with the fixture's.
    async fn identity_check(&self, identity: &IdentityFixture, outcome: &AuthenticationOutcome) -> CheckResult {
        let Some(token) = outcome.access_token.as_ref() else {
            return CheckResult::fail(CheckKind::Identity, "no access token");
        };
        let Some(expected) = identity.sid.as_deref() else {
            return CheckResult::fail(CheckKind::Identity, "no expected SID configured");
        };

        let user = match self.provider.get_user(token).await {
            Ok(user) => user,
            Err(e) => return CheckResult::fail(CheckKind::Identity, format!("user lookup failed: {e}")),
        };

        match SID_ATTRIBUTES.iter().find_map(|name| user.attribute(name)) {
            None => CheckResult::fail(CheckKind::Identity, "SID attribute not found"),
            Some(actual) if actual == expected => {
                CheckResult::pass(CheckKind::Identity, vec![actual.to_string()])
            }
            Some(actual) => CheckResult {
                observed: vec![actual.to_string()],
                ..CheckResult::fail(
                    CheckKind::Identity,
                    format!("expected {expected}, got {actual}"),
                )
            },
        }
    }
}

/// Expected permissions must be a subset of the permissions derived from
/// `groups`.
#[must_use]
pub fn permission_check(identity: &IdentityFixture, groups: &[String]) -> CheckResult {
    let actual = map_groups_to_permissions(groups);
    let missing: Vec<String> = identity
        .expected_permissions
        .difference(&actual)
        .cloned()
        .collect();
    let observed = actual.into_iter().collect();

    if missing.is_empty() {
        CheckResult::pass(CheckKind::Permissions, observed)
    } else {
        CheckResult {
            observed,
            ..CheckResult::fail(
                CheckKind::Permissions,
                format!("missing permissions: {}", missing.join(", ")),
            )
        }
    }
}

/// Never fetches real resources; passes with the expected set and records
/// the policy that prevented the fetch.
#[must_use]
pub fn resource_access_check(identity: &IdentityFixture, policy: WritePolicy) -> CheckResult {
    let simulated = policy.safeguard(&CheckKind::ResourceAccess.to_string());
    CheckResult {
        check: CheckKind::ResourceAccess,
        valid: true,
        reason: Some(simulated.reason),
        observed: identity.expected_resource_access.iter().cloned().collect(),
    }
}

/// Membership in the elevated group is necessary and sufficient.
#[must_use]
pub fn elevated_check(kind: CheckKind, groups: &[String]) -> CheckResult {
    if groups.iter().any(|group| group == ELEVATED_GROUP) {
        CheckResult::pass(kind, vec![ELEVATED_GROUP.to_string()])
    } else {
        CheckResult::fail(kind, format!("not a member of {ELEVATED_GROUP}"))
    }
}

/// A numbered identity `testuser<n>` must expect access to `user<n>-specific`.
#[must_use]
pub fn user_specific_check(identity: &IdentityFixture) -> CheckResult {
    let marker = match identity.kind {
        FixtureKind::Numbered(n) => format!("user{n}"),
        _ => identity.name.replace("testuser", "user"),
    };
    let found: Vec<String> = identity
        .expected_resource_access
        .iter()
        .filter(|resource| resource.contains(&marker))
        .cloned()
        .collect();

    if found.is_empty() {
        CheckResult::fail(
            CheckKind::UserSpecific,
            format!("no {marker}-specific resource configured"),
        )
    } else {
        CheckResult::pass(CheckKind::UserSpecific, found)
    }
}
