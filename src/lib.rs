//! # Vigil (Production Authentication Verification Harness)
//!
//! `vigil` runs live, read-mostly probes against a deployed identity provider
//! and its session store, across several regional deployments, and reports
//! pass/fail/skip outcomes with evidence (latency, token presence, group and
//! permission membership).
//!
//! ## Layers
//!
//! - [`backend`]: typed clients for the identity provider and the session store.
//! - [`fixtures`]: the immutable population of test identities.
//! - [`auth`]: the authentication probe and the validators built on it
//!   (session lifecycle, MFA challenge, SID/permission, multi-region).
//! - [`engine`]: the dependency-ordered orchestrator, the batched population
//!   executor and the report aggregator.
//! - [`suite`]: the authentication test suite wired from the pieces above.
//!
//! ## Protected environment
//!
//! Every operation that could mutate the live backend takes a
//! [`config::WritePolicy`] argument. Under [`config::WritePolicy::ReadOnly`]
//! those operations return a simulated success carrying an explicit reason and
//! never touch the backend.

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod fixtures;
pub mod suite;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
