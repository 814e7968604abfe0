use crate::config::ProductionConfig;
use crate::engine::batch::BatchPlan;
use crate::engine::report::{Report, ReportFormat, ReportHeader, Summary};
use crate::engine::{Orchestrator, RunOutcome, SuiteConfig, TestSuite};
use crate::fixtures::FixtureRegistry;
use crate::suite::Harness;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct Args {
    pub config: ProductionConfig,
    pub suite: SuiteConfig,
    pub batch: BatchPlan,
    pub numbered_users: usize,
    pub report: Option<PathBuf>,
    pub format: ReportFormat,
}

/// Run the suite with Ctrl-C wired to the orchestrator's stop signal.
///
/// # Errors
/// Returns an error if the suite definition is invalid.
pub async fn run_suite(suite: TestSuite) -> Result<RunOutcome> {
    let (stop, stopped) = watch::channel(false);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing running cases");
            stop.send_replace(true);
        }
    });

    let outcome = Orchestrator::new(suite).with_stop_signal(stopped).run().await;
    signal.abort();

    outcome.context("invalid test suite")
}

/// Write `rendered` to `path`, or stdout without one.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub async fn emit(rendered: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!("report written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

/// Verify the production deployment and report the outcome.
///
/// # Errors
/// Returns an error if the configuration is invalid, the backends cannot be
/// reached, the report cannot be written, or any case failed.
pub async fn execute(args: Args) -> Result<()> {
    let warnings = args.config.validate().into_result()?;
    for warning in warnings {
        warn!("{warning}");
    }
    info!(
        "verifying {} ({}) in {} mode",
        args.config.user_pool_id, args.config.region, args.config.write_policy
    );

    let fixtures = FixtureRegistry::from_env(args.numbered_users);
    let (with_secret, total) = fixtures.credential_coverage();
    info!("{with_secret} of {total} identities have a credential configured");
    if with_secret == 0 {
        warn!("no credentials configured: every probe will be skipped");
    }

    let harness = Arc::new(
        Harness::connect(args.config, fixtures)
            .context("failed to build backend clients")?
            .with_batch_plan(args.batch),
    );

    let suite = harness.suite(args.suite);
    for warning in suite.warnings() {
        warn!("{warning}");
    }

    let outcome = run_suite(suite).await?;

    let config = harness.config();
    let report = Report::new(
        ReportHeader::new(&outcome.suite, &config.region, &config.user_pool_id),
        &outcome,
    );
    let rendered = report.render(args.format).context("failed to render report")?;
    emit(&rendered, args.report.as_deref()).await?;

    let summary: &Summary = &report.summary;
    info!(
        "{} passed, {} failed, {} skipped in {} ms",
        summary.passed_tests, summary.failed_tests, summary.skipped_tests, summary.total_duration_ms
    );

    if summary.passed() {
        Ok(())
    } else {
        error!("{} of {} cases failed", summary.failed_tests, summary.total_tests);
        Err(anyhow!(
            "verification failed: {} of {} cases failed",
            summary.failed_tests,
            summary.total_tests
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{Observation, TestCase, TestStatus};

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let args = Args {
            config: ProductionConfig::new("ap-northeast-1", "", "", ""),
            suite: SuiteConfig::default(),
            batch: BatchPlan::default(),
            numbered_users: 0,
            report: None,
            format: ReportFormat::Markdown,
        };
        let err = execute(args).await.unwrap_err();
        assert!(err.to_string().contains("user pool id is not set"));
    }

    #[tokio::test]
    async fn test_run_suite() {
        let suite = TestSuite::new("s", SuiteConfig::default())
            .with_case(TestCase::new("a", "a", || async { Ok(Observation::observed(true)) }));
        let outcome = run_suite(suite).await.unwrap();
        assert_eq!(outcome.results.get("a").unwrap().status, TestStatus::Completed);
    }

    #[tokio::test]
    async fn test_emit_to_file() {
        let path = std::env::temp_dir().join(format!("vigil-report-{}.md", uuid::Uuid::new_v4()));
        emit("# report", Some(&path)).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "# report");
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
