use crate::config::{ProductionConfig, WritePolicy, DEFAULT_REGION};
use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use url::Url;

pub const ARG_REGION: &str = "region";
pub const ARG_USER_POOL_ID: &str = "user-pool-id";
pub const ARG_CLIENT_ID: &str = "client-id";
pub const ARG_SESSION_TABLE: &str = "session-table";
pub const ARG_IDP_ENDPOINT: &str = "idp-endpoint";
pub const ARG_SESSION_STORE_ENDPOINT: &str = "session-store-endpoint";
pub const ARG_READ_ONLY: &str = "read-only";

pub struct Options;

impl Options {
    /// Build the production configuration from matches.
    ///
    /// # Errors
    /// Returns an error if an endpoint override is not a valid URL.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<ProductionConfig> {
        let read = |id: &str| matches.get_one::<String>(id).cloned().unwrap_or_default();
        let read_url = |id: &str| -> anyhow::Result<Option<Url>> {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.trim().is_empty())
                .map(|v| Url::parse(v).with_context(|| format!("invalid --{id}: {v}")))
                .transpose()
        };

        let read_only = matches.get_one::<bool>(ARG_READ_ONLY).copied().unwrap_or(true);
        let region = matches
            .get_one::<String>(ARG_REGION)
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut config = ProductionConfig::new(
            region,
            read(ARG_USER_POOL_ID),
            read(ARG_CLIENT_ID),
            read(ARG_SESSION_TABLE),
        )
        .with_write_policy(WritePolicy::from_read_only(read_only));

        if let Some(endpoint) = read_url(ARG_IDP_ENDPOINT)? {
            config = config.with_idp_endpoint(endpoint);
        }
        if let Some(endpoint) = read_url(ARG_SESSION_STORE_ENDPOINT)? {
            config = config.with_session_store_endpoint(endpoint);
        }

        Ok(config)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REGION)
                .short('r')
                .long(ARG_REGION)
                .help("Default region of the identity provider")
                .env("VIGIL_REGION")
                .default_value(DEFAULT_REGION),
        )
        .arg(
            Arg::new(ARG_USER_POOL_ID)
                .long(ARG_USER_POOL_ID)
                .help("User pool id in the default region")
                .env("VIGIL_USER_POOL_ID"),
        )
        .arg(
            Arg::new(ARG_CLIENT_ID)
                .long(ARG_CLIENT_ID)
                .help("App client id in the default region")
                .env("VIGIL_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_SESSION_TABLE)
                .long(ARG_SESSION_TABLE)
                .help("Session store table name")
                .env("VIGIL_SESSION_TABLE"),
        )
        .arg(
            Arg::new(ARG_IDP_ENDPOINT)
                .long(ARG_IDP_ENDPOINT)
                .help("Identity provider URL override")
                .long_help(
                    "Identity provider URL override. Admin operations must be signed, so point this at a signing proxy when running against a live pool.",
                )
                .env("VIGIL_IDP_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_SESSION_STORE_ENDPOINT)
                .long(ARG_SESSION_STORE_ENDPOINT)
                .help("Session store URL override")
                .env("VIGIL_SESSION_STORE_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_READ_ONLY)
                .long(ARG_READ_ONLY)
                .help("Simulate every write instead of touching the live backend")
                .env("VIGIL_READ_ONLY")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}
