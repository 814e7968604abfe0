use crate::engine::batch::BatchPlan;
use crate::engine::report::ReportFormat;
use crate::engine::{SuiteConfig, DEFAULT_RETRY_BACKOFF};
use clap::{builder::PossibleValuesParser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

pub const ARG_BATCH_SIZE: &str = "batch-size";
pub const ARG_BATCH_DELAY_MS: &str = "batch-delay-ms";
pub const ARG_NUMBERED_USERS: &str = "numbered-users";
pub const ARG_PARALLEL: &str = "parallel";
pub const ARG_MAX_CONCURRENCY: &str = "max-concurrency";
pub const ARG_FAIL_FAST: &str = "fail-fast";
pub const ARG_REPORT: &str = "report";
pub const ARG_FORMAT: &str = "format";

#[derive(Debug, Clone)]
pub struct Options {
    pub suite: SuiteConfig,
    pub batch: BatchPlan,
    pub numbered_users: usize,
    pub report: Option<PathBuf>,
    pub format: ReportFormat,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let suite = SuiteConfig {
            parallel: matches.get_flag(ARG_PARALLEL),
            max_concurrency: matches.get_one::<usize>(ARG_MAX_CONCURRENCY).copied().unwrap_or(1),
            fail_fast: matches.get_flag(ARG_FAIL_FAST),
            continue_on_error: true,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        };

        let batch = BatchPlan::new(
            matches.get_one::<usize>(ARG_BATCH_SIZE).copied().unwrap_or(3),
            Duration::from_millis(matches.get_one::<u64>(ARG_BATCH_DELAY_MS).copied().unwrap_or(1000)),
        );

        let format = match matches.get_one::<String>(ARG_FORMAT).map(String::as_str) {
            Some("json") => ReportFormat::Json,
            _ => ReportFormat::Markdown,
        };

        Self {
            suite,
            batch,
            numbered_users: matches.get_one::<usize>(ARG_NUMBERED_USERS).copied().unwrap_or(10),
            report: matches.get_one::<PathBuf>(ARG_REPORT).cloned(),
            format,
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BATCH_SIZE)
                .long(ARG_BATCH_SIZE)
                .help("Identities probed concurrently per batch")
                .env("VIGIL_BATCH_SIZE")
                .default_value("3")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_BATCH_DELAY_MS)
                .long(ARG_BATCH_DELAY_MS)
                .help("Pause between batches in milliseconds")
                .env("VIGIL_BATCH_DELAY_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_NUMBERED_USERS)
                .long(ARG_NUMBERED_USERS)
                .help("Size of the numbered identity population (testuser0..N)")
                .env("VIGIL_NUMBERED_USERS")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_PARALLEL)
                .long(ARG_PARALLEL)
                .help("Run independent cases concurrently")
                .env("VIGIL_PARALLEL")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_MAX_CONCURRENCY)
                .long(ARG_MAX_CONCURRENCY)
                .help("Cases in flight at once when --parallel is set")
                .env("VIGIL_MAX_CONCURRENCY")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_FAIL_FAST)
                .long(ARG_FAIL_FAST)
                .help("Stop scheduling cases after the first failure")
                .env("VIGIL_FAIL_FAST")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_REPORT)
                .long(ARG_REPORT)
                .help("Write the report to this file instead of stdout")
                .env("VIGIL_REPORT")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(ARG_FORMAT)
                .long(ARG_FORMAT)
                .help("Report format")
                .env("VIGIL_REPORT_FORMAT")
                .default_value("markdown")
                .value_parser(PossibleValuesParser::new(["markdown", "json"])),
        )
}
