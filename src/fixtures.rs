//! Test identities the harness authenticates as.
//!
//! Identities are sourced from the environment once at start-up and shared
//! behind `Arc`; nothing mutates a fixture after the registry is built.

use regex::Regex;
use secrecy::SecretString;
use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use tracing::warn;

pub const SID_PREFIX: &str = "S-1-5-21-1000000000-1000000000-1000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    Standard,
    /// Expected to hold the elevated group.
    Admin,
    /// Member `n` of the numbered population (`testuser<n>`).
    Numbered(usize),
}

#[derive(Debug)]
pub struct IdentityFixture {
    pub name: String,
    pub secret: Option<SecretString>,
    pub sid: Option<String>,
    pub kind: FixtureKind,
    pub expected_groups: BTreeSet<String>,
    pub expected_permissions: BTreeSet<String>,
    pub expected_resource_access: BTreeSet<String>,
    pub mfa_enabled: bool,
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(ToString::to_string).collect()
}

impl IdentityFixture {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            secret: None,
            sid: None,
            kind: FixtureKind::Standard,
            expected_groups: BTreeSet::new(),
            expected_permissions: BTreeSet::new(),
            expected_resource_access: BTreeSet::new(),
            mfa_enabled: false,
        }
    }

    /// Empty secrets are treated as unset.
    #[must_use]
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        self
    }

    #[must_use]
    pub fn with_sid(mut self, sid: &str) -> Self {
        self.sid = Some(sid.to_string());
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: FixtureKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.expected_groups = set(groups);
        self
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.expected_permissions = set(permissions);
        self
    }

    #[must_use]
    pub fn with_resource_access(mut self, resources: &[&str]) -> Self {
        self.expected_resource_access = set(resources);
        self
    }

    #[must_use]
    pub const fn with_mfa(mut self, enabled: bool) -> Self {
        self.mfa_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}

/// `S-1-5-21-<a>-<b>-<c>-<rid>`
#[must_use]
pub fn sid_is_well_formed(sid: &str) -> bool {
    Regex::new(r"^S-1-5-21-\d+-\d+-\d+-\d+$").map_or(false, |re| re.is_match(sid))
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_sid(key: &str, default: String) -> String {
    match env_value(key) {
        Some(sid) if sid_is_well_formed(&sid) => sid,
        Some(sid) => {
            warn!("ignoring malformed SID in {key}: {sid}");
            default
        }
        None => default,
    }
}

/// The population of test identities for one run.
#[derive(Debug, Clone)]
pub struct FixtureRegistry {
    /// Probe identity for the credential, session and flow cases.
    pub primary: Arc<IdentityFixture>,
    /// MFA-enrolled identity.
    pub mfa: Arc<IdentityFixture>,
    /// Standard SID-mapped identity, also used for the regional probes.
    pub sid_user: Arc<IdentityFixture>,
    pub admin: Arc<IdentityFixture>,
    pub numbered: Vec<Arc<IdentityFixture>>,
}

impl FixtureRegistry {
    #[must_use]
    pub fn new(
        primary: IdentityFixture,
        mfa: IdentityFixture,
        sid_user: IdentityFixture,
        admin: IdentityFixture,
        numbered: Vec<IdentityFixture>,
    ) -> Self {
        Self {
            primary: Arc::new(primary),
            mfa: Arc::new(mfa),
            sid_user: Arc::new(sid_user),
            admin: Arc::new(admin),
            numbered: numbered.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build the registry from `VIGIL_*` environment variables; every
    /// password is optional and identities without one are skipped by the
    /// probe.
    #[must_use]
    pub fn from_env(numbered_users: usize) -> Self {
        let primary = IdentityFixture::new(
            &env_value("VIGIL_TEST_USER_1_USERNAME").unwrap_or_else(|| "test-user-1".to_string()),
        )
        .with_secret(env_value("VIGIL_TEST_USER_1_PASSWORD"))
        .with_groups(&["users"])
        .with_permissions(&["read", "write"]);

        let mfa = IdentityFixture::new(
            &env_value("VIGIL_TEST_USER_2_USERNAME").unwrap_or_else(|| "test-user-2".to_string()),
        )
        .with_secret(env_value("VIGIL_TEST_USER_2_PASSWORD"))
        .with_groups(&["readonly-users"])
        .with_permissions(&["read"])
        .with_mfa(true);

        let sid_user = IdentityFixture::new(
            &env_value("VIGIL_TESTUSER_USERNAME").unwrap_or_else(|| "testuser".to_string()),
        )
        .with_secret(env_value("VIGIL_TESTUSER_PASSWORD"))
        .with_sid(&env_sid("VIGIL_TESTUSER_SID", format!("{SID_PREFIX}-1001")))
        .with_groups(&["users", "basic-access"])
        .with_permissions(&["read", "write", "chat"])
        .with_resource_access(&["public", "user-specific"]);

        let admin = IdentityFixture::new("admin")
            .with_secret(env_value("VIGIL_ADMIN_PASSWORD"))
            .with_sid(&env_sid("VIGIL_ADMIN_SID", format!("{SID_PREFIX}-500")))
            .with_kind(FixtureKind::Admin)
            .with_groups(&["administrators", "users", "full-access"])
            .with_permissions(&["read", "write", "delete", "admin", "chat", "manage"])
            .with_resource_access(&["public", "user-specific", "admin-only", "confidential"]);

        let numbered = (0..numbered_users)
            .map(|i| {
                let specific = format!("user{i}-specific");
                IdentityFixture::new(&format!("testuser{i}"))
                    .with_secret(env_value(&format!("VIGIL_TESTUSER{i}_PASSWORD")))
                    .with_sid(&env_sid(
                        &format!("VIGIL_TESTUSER{i}_SID"),
                        format!("{SID_PREFIX}-{}", 1001 + i),
                    ))
                    .with_kind(FixtureKind::Numbered(i))
                    .with_groups(&["users", "numbered-users"])
                    .with_permissions(&["read", "chat"])
                    .with_resource_access(&["public", specific.as_str()])
            })
            .collect();

        Self::new(primary, mfa, sid_user, admin, numbered)
    }

    /// Identities with a credential, out of all identities.
    #[must_use]
    pub fn credential_coverage(&self) -> (usize, usize) {
        let all: Vec<&Arc<IdentityFixture>> = [&self.primary, &self.mfa, &self.sid_user, &self.admin]
            .into_iter()
            .chain(self.numbered.iter())
            .collect();
        let with_secret = all.iter().filter(|f| f.has_secret()).count();
        (with_secret, all.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD_VARS: [&str; 7] = [
        "VIGIL_TEST_USER_1_USERNAME",
        "VIGIL_TEST_USER_1_PASSWORD",
        "VIGIL_TEST_USER_2_PASSWORD",
        "VIGIL_TESTUSER_PASSWORD",
        "VIGIL_ADMIN_PASSWORD",
        "VIGIL_TESTUSER_SID",
        "VIGIL_ADMIN_SID",
    ];

    #[test]
    fn test_defaults_without_credentials() {
        let unset: Vec<(&str, Option<&str>)> = PASSWORD_VARS.iter().map(|k| (*k, None)).collect();
        temp_env::with_vars(unset, || {
            let registry = FixtureRegistry::from_env(10);
            assert_eq!(registry.primary.name, "test-user-1");
            assert!(!registry.primary.has_secret());
            assert!(registry.mfa.mfa_enabled);
            assert_eq!(
                registry.sid_user.sid.as_deref(),
                Some("S-1-5-21-1000000000-1000000000-1000000000-1001")
            );
            assert_eq!(
                registry.admin.sid.as_deref(),
                Some("S-1-5-21-1000000000-1000000000-1000000000-500")
            );
            assert_eq!(registry.numbered.len(), 10);
        });
    }

    #[test]
    fn test_numbered_population() {
        temp_env::with_vars([("VIGIL_TESTUSER3_PASSWORD", Some("pw3"))], || {
            let registry = FixtureRegistry::from_env(5);
            let third = &registry.numbered[3];
            assert_eq!(third.name, "testuser3");
            assert_eq!(third.kind, FixtureKind::Numbered(3));
            assert!(third.has_secret());
            assert!(!registry.numbered[4].has_secret());
            assert_eq!(
                third.sid.as_deref(),
                Some("S-1-5-21-1000000000-1000000000-1000000000-1004")
            );
            assert!(third.expected_resource_access.contains("user3-specific"));
        });
    }

    #[test]
    fn test_malformed_sid_falls_back() {
        temp_env::with_vars([("VIGIL_TESTUSER_SID", Some("not-a-sid"))], || {
            let registry = FixtureRegistry::from_env(0);
            assert_eq!(
                registry.sid_user.sid.as_deref(),
                Some("S-1-5-21-1000000000-1000000000-1000000000-1001")
            );
        });
    }

    #[test]
    fn test_empty_secret_is_unset() {
        temp_env::with_vars([("VIGIL_ADMIN_PASSWORD", Some(""))], || {
            assert!(!FixtureRegistry::from_env(0).admin.has_secret());
        });
    }

    #[test]
    fn test_credential_coverage() {
        let registry = FixtureRegistry::new(
            IdentityFixture::new("a").with_secret(Some("pw".into())),
            IdentityFixture::new("b"),
            IdentityFixture::new("c"),
            IdentityFixture::new("d").with_secret(Some("pw".into())),
            vec![IdentityFixture::new("e")],
        );
        assert_eq!(registry.credential_coverage(), (2, 5));
    }

    #[test]
    fn test_sid_format() {
        assert!(sid_is_well_formed("S-1-5-21-1000000000-1000000000-1000000000-500"));
        assert!(!sid_is_well_formed("S-1-5-21-1-2-3"));
        assert!(!sid_is_well_formed(""));
    }
}
