//! Test orchestration: case and suite definitions, results, and the run
//! entry points.
//!
//! A [`TestCase`] produces an [`Observation`]; the orchestrator turns it into
//! a [`TestResult`] by applying the case's [`ExpectedOutcome`]. That is the
//! only place success polarity is decided.

pub mod batch;
pub mod report;
mod run;

pub use self::run::{execute_case, Orchestrator, RunOutcome};

use crate::auth::mfa::MfaDetails;
use crate::auth::region::RegionDetails;
use crate::auth::session::SessionDetails;
use crate::auth::sid::SidDetails;
use crate::auth::{AuthDetails, ProbeError};
use crate::backend::BackendError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_CATEGORY: &str = "authentication";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// What a passing run of the case looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    ShouldSucceed,
    /// Negative test: the operation is expected to be refused.
    ShouldFail,
}

impl ExpectedOutcome {
    /// Whether the observed operation result passes the case.
    #[must_use]
    pub const fn judge(self, operation_succeeded: bool) -> bool {
        match self {
            Self::ShouldSucceed => operation_succeeded,
            Self::ShouldFail => !operation_succeeded,
        }
    }

    const fn mismatch(self) -> &'static str {
        match self {
            Self::ShouldSucceed => "operation did not succeed",
            Self::ShouldFail => "operation succeeded but was expected to be refused",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaseError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Other(String),
}

impl CaseError {
    /// Transport and malformed-response failures are retried; everything
    /// else is final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Probe(e) => e.is_transient(),
            Self::Backend(e) => e.is_transient(),
            Self::Other(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Details {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa: Option<MfaDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<SidDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionDetails>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TestResult>,
}

impl Details {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auth.is_none()
            && self.session.is_none()
            && self.mfa.is_none()
            && self.sid.is_none()
            && self.region.is_none()
            && self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The operation ran; `success` is its raw result, before polarity.
    Observed { success: bool, error: Option<String> },
    Skipped(String),
}

/// What one execution of a case saw.
#[derive(Debug, Clone)]
pub struct Observation {
    pub verdict: Verdict,
    pub details: Details,
    pub metadata: BTreeMap<String, Value>,
}

impl Observation {
    #[must_use]
    pub fn observed(success: bool) -> Self {
        Self {
            verdict: Verdict::Observed { success, error: None },
            details: Details::default(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self::observed(false).with_error(error)
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Skipped(reason.into()),
            ..Self::observed(false)
        }
    }

    /// Attach an error message; ignored for skipped observations.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        if let Verdict::Observed { error, .. } = &mut self.verdict {
            *error = Some(message.into());
        }
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthDetails) -> Self {
        self.details.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionDetails) -> Self {
        self.details.session = Some(session);
        self
    }

    #[must_use]
    pub fn with_mfa(mut self, mfa: MfaDetails) -> Self {
        self.details.mfa = Some(mfa);
        self
    }

    #[must_use]
    pub fn with_sid(mut self, sid: SidDetails) -> Self {
        self.details.sid = Some(sid);
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: RegionDetails) -> Self {
        self.details.region = Some(region);
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<TestResult>) -> Self {
        self.details.children = children;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Serialize) -> Self {
        self.metadata
            .insert(key.to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
        self
    }
}

/// Wall-clock and monotonic start of a measured span.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Stopwatch {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn stop(self) -> Timing {
        Timing {
            start_time: self.start_time,
            end_time: Utc::now(),
            duration: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
}

impl Timing {
    #[must_use]
    pub fn instant() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: String,
    pub test_name: String,
    pub category: String,
    pub status: TestStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub details: Details,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TestResult {
    fn base(id: &str, name: &str, category: &str, status: TestStatus, timing: Timing) -> Self {
        Self {
            test_id: id.to_string(),
            test_name: name.to_string(),
            category: category.to_string(),
            status,
            start_time: timing.start_time,
            end_time: timing.end_time,
            duration_ms: millis(timing.duration),
            success: status != TestStatus::Failed,
            error: None,
            skip_reason: None,
            attempts: 0,
            metadata: BTreeMap::new(),
            details: Details::default(),
        }
    }

    /// Apply `expected` to an observation. Skips stay skips regardless of
    /// polarity.
    #[must_use]
    pub fn conclude(
        id: &str,
        name: &str,
        category: &str,
        expected: ExpectedOutcome,
        observation: Observation,
        timing: Timing,
    ) -> Self {
        let (status, error, skip_reason) = match observation.verdict {
            Verdict::Skipped(reason) => (TestStatus::Skipped, None, Some(reason)),
            Verdict::Observed { success, error } => {
                if expected.judge(success) {
                    (TestStatus::Completed, None, None)
                } else {
                    let error = error.unwrap_or_else(|| expected.mismatch().to_string());
                    (TestStatus::Failed, Some(error), None)
                }
            }
        };

        let mut result = Self::base(id, name, category, status, timing);
        result.error = error;
        result.skip_reason = skip_reason;
        result.attempts = 1;
        result.metadata = observation.metadata;
        result.details = observation.details;
        result
    }

    #[must_use]
    pub fn failed(id: &str, name: &str, category: &str, error: impl Into<String>, timing: Timing) -> Self {
        let mut result = Self::base(id, name, category, TestStatus::Failed, timing);
        result.error = Some(error.into());
        result.attempts = 1;
        result
    }

    /// A case that was never invoked.
    #[must_use]
    pub fn skipped(id: &str, name: &str, category: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::base(id, name, category, TestStatus::Skipped, Timing::instant());
        result.skip_reason = Some(reason.into());
        result
    }
}

pub type CaseFuture = Pin<Box<dyn Future<Output = Result<Observation, CaseError>> + Send>>;
pub type CaseFn = Arc<dyn Fn() -> CaseFuture + Send + Sync>;

#[derive(Clone)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub dependencies: Vec<String>,
    pub expected: ExpectedOutcome,
    pub execute: CaseFn,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("dependencies", &self.dependencies)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl TestCase {
    pub fn new<F, Fut>(id: &str, name: &str, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Observation, CaseError>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            description: String::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: 0,
            dependencies: Vec::new(),
            expected: ExpectedOutcome::ShouldSucceed,
            execute: Arc::new(move || -> CaseFuture { Box::pin(execute()) }),
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub const fn with_expected(mut self, expected: ExpectedOutcome) -> Self {
        self.expected = expected;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteConfig {
    pub parallel: bool,
    pub max_concurrency: usize,
    pub fail_fast: bool,
    pub continue_on_error: bool,
    #[serde(skip)]
    pub retry_backoff: Duration,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_concurrency: 1,
            fail_fast: false,
            continue_on_error: true,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl SuiteConfig {
    /// Cases allowed in flight at once.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        if self.parallel {
            self.max_concurrency.max(1)
        } else {
            1
        }
    }

    /// Whether one failure stops scheduling of the remaining cases.
    #[must_use]
    pub const fn halts_on_failure(&self) -> bool {
        self.fail_fast || !self.continue_on_error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuiteError {
    #[error("duplicate test case id: {0}")]
    DuplicateCase(String),
    #[error("test case {case} depends on unknown case {dependency}")]
    UnknownDependency { case: String, dependency: String },
    #[error("dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
    pub config: SuiteConfig,
}

impl TestSuite {
    #[must_use]
    pub fn new(name: &str, config: SuiteConfig) -> Self {
        Self {
            name: name.to_string(),
            cases: Vec::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    /// Indices of the cases in dependency order; ties keep definition order.
    ///
    /// # Errors
    /// Returns `SuiteError` for duplicate ids, unknown dependencies or cycles.
    pub fn execution_order(&self) -> Result<Vec<usize>, SuiteError> {
        let mut index = HashMap::new();
        for (i, case) in self.cases.iter().enumerate() {
            if index.insert(case.id.as_str(), i).is_some() {
                return Err(SuiteError::DuplicateCase(case.id.clone()));
            }
        }

        let mut pending = vec![0usize; self.cases.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.cases.len()];
        for (i, case) in self.cases.iter().enumerate() {
            let unique: HashSet<&str> = case.dependencies.iter().map(String::as_str).collect();
            for dependency in unique {
                let Some(&d) = index.get(dependency) else {
                    return Err(SuiteError::UnknownDependency {
                        case: case.id.clone(),
                        dependency: dependency.to_string(),
                    });
                };
                pending[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut order = Vec::with_capacity(self.cases.len());
        let mut done = vec![false; self.cases.len()];
        while order.len() < self.cases.len() {
            let Some(next) = (0..self.cases.len()).find(|&i| !done[i] && pending[i] == 0) else {
                let cycle = (0..self.cases.len())
                    .filter(|&i| !done[i])
                    .map(|i| self.cases[i].id.clone())
                    .collect();
                return Err(SuiteError::DependencyCycle(cycle));
            };
            done[next] = true;
            order.push(next);
            for &dependent in &dependents[next] {
                pending[dependent] -= 1;
            }
        }

        Ok(order)
    }

    /// Non-fatal configuration concerns.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.config.parallel && self.config.max_concurrency > 10 {
            warnings.push(format!(
                "max concurrency {} may exceed identity-provider rate limits",
                self.config.max_concurrency
            ));
        }
        for case in &self.cases {
            if case.timeout < DEFAULT_TIMEOUT {
                warnings.push(format!(
                    "{}: timeout of {} ms is below 30 s",
                    case.id,
                    case.timeout.as_millis()
                ));
            }
        }
        warnings
    }
}

/// Results keyed by case id, in insertion order. Each key is written once.
#[derive(Debug, Clone, Default)]
pub struct RunResults {
    order: Vec<String>,
    results: HashMap<String, TestResult>,
}

impl RunResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `result`; returns `false` and keeps the first result if the id
    /// was already recorded.
    pub fn insert(&mut self, result: TestResult) -> bool {
        if self.results.contains_key(&result.test_id) {
            return false;
        }
        self.order.push(result.test_id.clone());
        self.results.insert(result.test_id.clone(), result);
        true
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TestResult> {
        self.results.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestResult> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }
}
