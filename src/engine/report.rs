//! Reducing a run into counts and a Markdown or JSON report.

use super::{Details, RunOutcome, TestResult, TestStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    /// `passed / total`, 0 for an empty run.
    pub success_rate: f64,
    /// Wall-clock time of the whole run.
    pub total_duration_ms: u64,
    /// Sum of the individual case durations.
    pub cumulative_duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Summary {
    #[must_use]
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let count = |status| outcome.results.iter().filter(|r| r.status == status).count();
        let total = outcome.results.len();
        let passed = count(TestStatus::Completed);

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64
        };

        Self {
            total_tests: total,
            passed_tests: passed,
            failed_tests: count(TestStatus::Failed),
            skipped_tests: count(TestStatus::Skipped),
            success_rate,
            total_duration_ms: u64::try_from(outcome.wall_clock.as_millis()).unwrap_or(u64::MAX),
            cumulative_duration_ms: outcome.results.iter().map(|r| r.duration_ms).sum(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        }
    }

    /// Skips do not count against a run.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.failed_tests == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportHeader {
    pub suite: String,
    pub generated_at: DateTime<Utc>,
    pub region: String,
    pub user_pool_id: String,
    pub commit: String,
}

impl ReportHeader {
    #[must_use]
    pub fn new(suite: &str, region: &str, user_pool_id: &str) -> Self {
        Self {
            suite: suite.to_string(),
            generated_at: Utc::now(),
            region: region.to_string(),
            user_pool_id: user_pool_id.to_string(),
            commit: crate::GIT_COMMIT_HASH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Markdown,
    Json,
}

impl ReportFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub header: ReportHeader,
    pub summary: Summary,
    pub results: Vec<&'a TestResult>,
}

impl<'a> Report<'a> {
    #[must_use]
    pub fn new(header: ReportHeader, outcome: &'a RunOutcome) -> Self {
        Self {
            header,
            summary: Summary::from_outcome(outcome),
            results: outcome.results.iter().collect(),
        }
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        self.to_string()
    }

    /// # Errors
    /// Returns an error if JSON serialization fails.
    pub fn render(&self, format: ReportFormat) -> serde_json::Result<String> {
        match format {
            ReportFormat::Markdown => Ok(self.to_markdown()),
            ReportFormat::Json => self.to_json(),
        }
    }
}

fn status_icon(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Completed => "PASS",
        TestStatus::Failed => "FAIL",
        TestStatus::Skipped => "SKIP",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn join<'i>(items: impl IntoIterator<Item = &'i String>) -> String {
    let items: Vec<&str> = items.into_iter().map(String::as_str).collect();
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

fn write_details(f: &mut fmt::Formatter<'_>, details: &Details, indent: &str) -> fmt::Result {
    if let Some(auth) = &details.auth {
        writeln!(f, "{indent}- Authentication: {} in {} ms ({})", auth.status, auth.latency_ms, auth.region)?;
        writeln!(
            f,
            "{indent}  - Access token: {}, type: {}, expires in: {}",
            auth.access_token.as_deref().unwrap_or("none"),
            auth.token_type.as_deref().unwrap_or("-"),
            auth.expires_in.map_or_else(|| "-".to_string(), |secs| format!("{secs} s"))
        )?;
    }

    if let Some(session) = &details.session {
        writeln!(
            f,
            "{indent}- Session: created {}, valid {}, terminated {}",
            yes_no(session.session_created),
            yes_no(session.session_valid),
            yes_no(session.session_terminated)
        )?;
        for stage in &session.stages {
            let note = match (&stage.simulated, &stage.error) {
                (_, Some(error)) => format!(" ({error})"),
                (Some(reason), None) => format!(" ({reason})"),
                (None, None) => String::new(),
            };
            writeln!(f, "{indent}  - {}: {}{note}", stage.stage, yes_no(stage.success))?;
        }
    }

    if let Some(mfa) = &details.mfa {
        writeln!(
            f,
            "{indent}- MFA: required {}, challenge observed {}, type: {}",
            yes_no(mfa.mfa_required),
            yes_no(mfa.mfa_completed),
            mfa.challenge_type.as_deref().unwrap_or("-")
        )?;
    }

    if let Some(sid) = &details.sid {
        writeln!(
            f,
            "{indent}- SID: {} (expected groups: {}, permissions: {})",
            if sid.valid() { "valid" } else { "invalid" },
            join(&sid.expected_groups),
            join(&sid.expected_permissions)
        )?;
        for check in &sid.checks {
            match &check.reason {
                Some(reason) => writeln!(f, "{indent}  - {}: {} ({reason})", check.check, yes_no(check.valid))?,
                None => writeln!(f, "{indent}  - {}: {}", check.check, yes_no(check.valid))?,
            }
        }
    }

    if let Some(region) = &details.region {
        writeln!(
            f,
            "{indent}- Regions: primary {}, secondary {}, failover tested {}, consistent {}",
            region.primary_region,
            region.secondary_region,
            yes_no(region.failover_tested),
            yes_no(region.consistency_verified)
        )?;
        if let (Some(ok), Some(total)) = (region.successful_regions, region.total_regions) {
            writeln!(
                f,
                "{indent}  - Healthy regions: {ok}/{total}, average latency {:.1} ms",
                region.average_latency_ms.unwrap_or_default()
            )?;
        }
    }

    for child in &details.children {
        write_child(f, child, indent)?;
    }
    Ok(())
}

fn write_child(f: &mut fmt::Formatter<'_>, child: &TestResult, indent: &str) -> fmt::Result {
    write!(
        f,
        "{indent}- [{}] {} ({} ms)",
        status_icon(child.status),
        child.test_name,
        child.duration_ms
    )?;
    if let Some(error) = &child.error {
        write!(f, ": {error}")?;
    } else if let Some(reason) = &child.skip_reason {
        write!(f, ": {reason}")?;
    }
    writeln!(f)?;
    write_details(f, &child.details, &format!("{indent}  "))
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        let summary = &self.summary;

        writeln!(f, "# Authentication verification report: {}", header.suite)?;
        writeln!(f)?;
        writeln!(f, "- Generated: {}", header.generated_at.to_rfc3339())?;
        writeln!(f, "- Region: {}", header.region)?;
        writeln!(f, "- User pool: {}", header.user_pool_id)?;
        writeln!(f, "- Commit: {}", header.commit)?;
        writeln!(f)?;

        writeln!(f, "## Summary")?;
        writeln!(f)?;
        writeln!(f, "| Total | Passed | Failed | Skipped | Success rate | Duration |")?;
        writeln!(f, "|---|---|---|---|---|---|")?;
        writeln!(
            f,
            "| {} | {} | {} | {} | {:.1}% | {} ms |",
            summary.total_tests,
            summary.passed_tests,
            summary.failed_tests,
            summary.skipped_tests,
            summary.success_rate * 100.0,
            summary.total_duration_ms
        )?;
        writeln!(f)?;
        writeln!(f, "Result: {}", if summary.passed() { "PASSED" } else { "FAILED" })?;

        for result in &self.results {
            writeln!(f)?;
            writeln!(f, "## {}: {}", result.test_id, result.test_name)?;
            writeln!(f)?;
            writeln!(f, "- Status: {} ({})", status_icon(result.status), result.status)?;
            writeln!(f, "- Duration: {} ms", result.duration_ms)?;
            writeln!(f, "- Started: {}", result.start_time.to_rfc3339())?;
            writeln!(f, "- Finished: {}", result.end_time.to_rfc3339())?;
            if result.attempts > 1 {
                writeln!(f, "- Attempts: {}", result.attempts)?;
            }
            if let Some(error) = &result.error {
                writeln!(f, "- Error: {error}")?;
            }
            if let Some(reason) = &result.skip_reason {
                writeln!(f, "- Skip reason: {reason}")?;
            }
            write_details(f, &result.details, "")?;
        }
        Ok(())
    }
}
