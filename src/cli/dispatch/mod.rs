//! Maps parsed arguments to the action the binary runs.

use crate::cli::actions::{verify::Args, Action};
use crate::cli::commands::{backend, suite};
use anyhow::Result;

/// # Errors
/// Returns an error if an argument cannot be turned into configuration.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = backend::Options::parse(matches)?;
    let options = suite::Options::parse(matches);

    Ok(Action::Verify(Args {
        config,
        suite: options.suite,
        batch: options.batch,
        numbered_users: options.numbered_users,
        report: options.report,
        format: options.format,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn test_handler_builds_verify_action() {
        temp_env::with_vars(
            [
                ("VIGIL_USER_POOL_ID", Some("ap-northeast-1_pool")),
                ("VIGIL_CLIENT_ID", Some("client")),
                ("VIGIL_SESSION_TABLE", Some("sessions")),
                ("VIGIL_READ_ONLY", None),
                ("VIGIL_NUMBERED_USERS", Some("4")),
            ],
            || {
                let matches = commands::new().get_matches_from(vec!["vigil", "--batch-size", "2"]);
                let Action::Verify(args) = handler(&matches).unwrap();
                assert_eq!(args.config.user_pool_id, "ap-northeast-1_pool");
                assert!(args.config.write_policy.is_read_only());
                assert_eq!(args.batch.batch_size, 2);
                assert_eq!(args.numbered_users, 4);
            },
        );
    }
}
