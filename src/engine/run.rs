use super::{
    RunResults, SuiteError, TestCase, TestResult, TestStatus, TestSuite, Stopwatch, Timing,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const RUN_STOPPED: &str = "run stopped";

/// Everything a report needs about one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub suite: String,
    pub results: RunResults,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub wall_clock: Duration,
}

pub struct Orchestrator {
    suite: TestSuite,
    stop: Option<watch::Receiver<bool>>,
}

enum Attempt {
    Done(super::Observation),
    Retryable(String),
    Final(String),
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panicked: {message}")
}

/// Linear backoff (`base * attempt`) with +/-10% jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    base.saturating_mul(attempt).mul_f64(jitter)
}

/// Run one case to a result, honoring its timeout and retry budget.
/// Never panics and never returns an error; every failure becomes a
/// `Failed` result.
pub async fn execute_case(case: TestCase, retry_backoff: Duration) -> TestResult {
    let watch = Stopwatch::start();
    let mut attempts = 0;

    let last_error = loop {
        attempts += 1;
        debug!("{} attempt {attempts}", case.id);

        let handle = tokio::spawn((case.execute)());
        let abort = handle.abort_handle();
        let attempt = match timeout(case.timeout, handle).await {
            Ok(Ok(Ok(observation))) => Attempt::Done(observation),
            Ok(Ok(Err(e))) if e.is_retryable() => Attempt::Retryable(e.to_string()),
            Ok(Ok(Err(e))) => Attempt::Final(e.to_string()),
            Ok(Err(join)) => Attempt::Retryable(panic_message(join)),
            Err(_) => {
                abort.abort();
                Attempt::Retryable(format!("timed out after {} ms", case.timeout.as_millis()))
            }
        };

        match attempt {
            Attempt::Done(observation) => {
                let mut result = TestResult::conclude(
                    &case.id,
                    &case.name,
                    &case.category,
                    case.expected,
                    observation,
                    watch.stop(),
                );
                result.attempts = attempts;
                return result;
            }
            Attempt::Final(e) => break e,
            Attempt::Retryable(e) if attempts <= case.max_retries => {
                let delay = backoff(retry_backoff, attempts);
                warn!("{} failed ({e}), retrying in {} ms", case.id, delay.as_millis());
                sleep(delay).await;
            }
            Attempt::Retryable(e) => break e,
        }
    };

    let mut result = TestResult::failed(&case.id, &case.name, &case.category, last_error, watch.stop());
    result.attempts = attempts;
    result
}

impl Orchestrator {
    #[must_use]
    pub const fn new(suite: TestSuite) -> Self {
        Self { suite, stop: None }
    }

    /// Stop scheduling new cases once the receiver reads `true`.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    #[must_use]
    pub const fn suite(&self) -> &TestSuite {
        &self.suite
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    /// Execute every case, respecting dependencies. The returned results
    /// hold exactly one entry per case, in completion order.
    ///
    /// # Errors
    /// Returns `SuiteError` if the suite definition is invalid; no case is
    /// run in that case.
    pub async fn run(&self) -> Result<RunOutcome, SuiteError> {
        let order = self.suite.execution_order()?;
        let config = self.suite.config;
        let concurrency = config.concurrency();
        let watch = Stopwatch::start();

        info!(
            "running suite {} ({} cases, concurrency {concurrency})",
            self.suite.name,
            self.suite.cases.len()
        );

        let mut results = RunResults::new();
        let mut queue: Vec<usize> = order;
        let mut running: JoinSet<TestResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, usize> = HashMap::new();
        let mut halted: Option<String> = None;

        loop {
            if halted.is_none() && self.stopped() {
                warn!("stop requested, no further cases will be scheduled");
                halted = Some(RUN_STOPPED.to_string());
            }

            // Resolve blocked and halted cases, then launch what is ready.
            let mut index = 0;
            while index < queue.len() {
                let case = &self.suite.cases[queue[index]];

                if let Some(reason) = &halted {
                    results.insert(TestResult::skipped(&case.id, &case.name, &case.category, reason.clone()));
                    queue.remove(index);
                    continue;
                }

                let blocker = case.dependencies.iter().find(|dep| {
                    results
                        .get(dep)
                        .is_some_and(|r| r.status == TestStatus::Failed || is_blocked(r))
                });
                if let Some(dep) = blocker {
                    info!("{} blocked by {dep}", case.id);
                    results.insert(TestResult::skipped(
                        &case.id,
                        &case.name,
                        &case.category,
                        format!("{BLOCKED_PREFIX}{dep}"),
                    ));
                    queue.remove(index);
                    continue;
                }

                let ready = case.dependencies.iter().all(|dep| results.contains(dep));
                if ready && running.len() < concurrency {
                    let span = info_span!("case", id = %case.id);
                    let handle = running.spawn(
                        execute_case(case.clone(), config.retry_backoff).instrument(span),
                    );
                    in_flight.insert(handle.id(), queue[index]);
                    queue.remove(index);
                    continue;
                }

                index += 1;
            }

            if running.is_empty() {
                if queue.is_empty() {
                    break;
                }
                // Nothing running and nothing launchable; cannot happen for a
                // validated suite, but never spin.
                for i in queue.drain(..) {
                    let case = &self.suite.cases[i];
                    results.insert(TestResult::skipped(&case.id, &case.name, &case.category, "dependencies never completed"));
                }
                break;
            }

            let Some(joined) = running.join_next_with_id().await else {
                continue;
            };

            let result = match joined {
                Ok((id, result)) => {
                    in_flight.remove(&id);
                    result
                }
                Err(join) => {
                    let Some(i) = in_flight.remove(&join.id()) else {
                        error!("lost track of a finished case: {join}");
                        continue;
                    };
                    let case = &self.suite.cases[i];
                    TestResult::failed(&case.id, &case.name, &case.category, panic_message(join), Timing::instant())
                }
            };

            match result.status {
                TestStatus::Completed => info!("{} completed in {} ms", result.test_id, result.duration_ms),
                TestStatus::Failed => warn!(
                    "{} failed: {}",
                    result.test_id,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                TestStatus::Skipped => info!(
                    "{} skipped: {}",
                    result.test_id,
                    result.skip_reason.as_deref().unwrap_or("")
                ),
            }

            if result.status == TestStatus::Failed && config.halts_on_failure() && halted.is_none() {
                halted = Some(format!("run halted after failure of {}", result.test_id));
            }

            results.insert(result);
        }

        let timing = watch.stop();
        Ok(RunOutcome {
            suite: self.suite.name.clone(),
            results,
            started_at: timing.start_time,
            finished_at: timing.end_time,
            wall_clock: timing.duration,
        })
    }
}

pub const BLOCKED_PREFIX: &str = "blocked by failed dependency ";

fn is_blocked(result: &TestResult) -> bool {
    result.status == TestStatus::Skipped
        && result
            .skip_reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with(BLOCKED_PREFIX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::engine::{CaseError, ExpectedOutcome, Observation, SuiteConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn passing(id: &str) -> TestCase {
        TestCase::new(id, id, || async { Ok(Observation::observed(true)) })
    }

    fn failing(id: &str) -> TestCase {
        TestCase::new(id, id, || async { Ok(Observation::failed("assertion failed")) })
    }

    fn config() -> SuiteConfig {
        SuiteConfig {
            retry_backoff: Duration::from_millis(10),
            ..SuiteConfig::default()
        }
    }

    async fn run(suite: TestSuite) -> RunOutcome {
        Orchestrator::new(suite).run().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_result_per_case() {
        let suite = TestSuite::new("s", config())
            .with_case(passing("a"))
            .with_case(failing("b"))
            .with_case(passing("c").with_dependencies(&["b"]))
            .with_case(passing("d").with_dependencies(&["c"]))
            .with_case(passing("e"));
        let outcome = run(suite).await;
        let results = &outcome.results;

        assert_eq!(results.len(), 5);
        assert_eq!(results.get("a").unwrap().status, TestStatus::Completed);
        assert_eq!(results.get("b").unwrap().status, TestStatus::Failed);
        let c = results.get("c").unwrap();
        assert_eq!(c.status, TestStatus::Skipped);
        assert_eq!(c.skip_reason.as_deref(), Some("blocked by failed dependency b"));
        assert_eq!(
            results.get("d").unwrap().skip_reason.as_deref(),
            Some("blocked by failed dependency c")
        );
        // continue-on-error: independent case still runs
        assert_eq!(results.get("e").unwrap().status, TestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependencies_run_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let case = |id: &'static str, deps: &[&str]| {
            let log = log.clone();
            TestCase::new(id, id, move || {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(id);
                    Ok(Observation::observed(true))
                }
            })
            .with_dependencies(deps)
        };
        let suite = TestSuite::new("s", config())
            .with_case(case("flow", &["valid", "session"]))
            .with_case(case("session", &["valid"]))
            .with_case(case("valid", &[]));
        let outcome = run(suite).await;

        assert_eq!(*log.lock().unwrap(), vec!["valid", "session", "flow"]);
        let order: Vec<&str> = outcome.results.iter().map(|r| r.test_id.as_str()).collect();
        assert_eq!(order, vec!["valid", "session", "flow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_dependency_does_not_block() {
        let suite = TestSuite::new("s", config())
            .with_case(TestCase::new("a", "a", || async { Ok(Observation::skipped("no credential")) }))
            .with_case(passing("b").with_dependencies(&["a"]));
        let outcome = run(suite).await;
        assert_eq!(outcome.results.get("b").unwrap().status, TestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_failed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow = TestCase::new("slow", "slow", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(120)).await;
                Ok(Observation::observed(true))
            }
        })
        .with_timeout(Duration::from_secs(30))
        .with_retries(2);

        let result = execute_case(slow, Duration::from_millis(10)).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("timed out after 30000 ms"));
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = TestCase::new("flaky", "flaky", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CaseError::Backend(BackendError::Transport("reset".to_string())))
                } else {
                    Ok(Observation::observed(true))
                }
            }
        })
        .with_retries(2);

        let result = execute_case(flaky, Duration::from_secs(1)).await;
        assert_eq!(result.status, TestStatus::Completed);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let truncated = TestCase::new("truncated", "truncated", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CaseError::Backend(BackendError::Malformed("truncated body".to_string())))
                } else {
                    Ok(Observation::observed(true))
                }
            }
        })
        .with_retries(2);

        let result = execute_case(truncated, Duration::from_secs(1)).await;
        assert_eq!(result.status, TestStatus::Completed);
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assertion_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let case = TestCase::new("a", "a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CaseError::Other("claim mismatch".to_string())) }
        })
        .with_retries(3);

        let result = execute_case(case, Duration::from_millis(10)).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("claim mismatch"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_failed_result() {
        let case = TestCase::new("boom", "boom", || async {
            if true {
                panic!("probe exploded");
            }
            Ok(Observation::observed(true))
        });
        let suite = TestSuite::new("s", config()).with_case(case).with_case(passing("after"));
        let outcome = run(suite).await;

        let boom = outcome.results.get("boom").unwrap();
        assert_eq!(boom.status, TestStatus::Failed);
        assert_eq!(boom.error.as_deref(), Some("panicked: probe exploded"));
        assert_eq!(outcome.results.get("after").unwrap().status, TestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_case_passes_on_refusal() {
        let suite = TestSuite::new("s", config()).with_case(
            TestCase::new("auth-invalid-001", "invalid", || async {
                Ok(Observation::observed(false).with_error("NotAuthorizedException"))
            })
            .with_expected(ExpectedOutcome::ShouldFail),
        );
        let outcome = run(suite).await;
        let result = outcome.results.get("auth-invalid-001").unwrap();
        assert_eq!(result.status, TestStatus::Completed);
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_skips_the_rest() {
        let suite = TestSuite::new(
            "s",
            SuiteConfig {
                fail_fast: true,
                ..config()
            },
        )
        .with_case(failing("a"))
        .with_case(passing("b"))
        .with_case(passing("c"));
        let outcome = run(suite).await;

        assert_eq!(outcome.results.len(), 3);
        for id in ["b", "c"] {
            let result = outcome.results.get(id).unwrap();
            assert_eq!(result.status, TestStatus::Skipped);
            assert_eq!(result.skip_reason.as_deref(), Some("run halted after failure of a"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_skips_unstarted_cases() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let trigger = tx.clone();
        let suite = TestSuite::new("s", config())
            .with_case(TestCase::new("a", "a", move || {
                let trigger = trigger.clone();
                async move {
                    trigger.send_replace(true);
                    Ok(Observation::observed(true))
                }
            }))
            .with_case(passing("b"));
        let outcome = Orchestrator::new(suite).with_stop_signal(rx).run().await.unwrap();

        assert_eq!(outcome.results.get("a").unwrap().status, TestStatus::Completed);
        assert_eq!(outcome.results.get("b").unwrap().skip_reason.as_deref(), Some(RUN_STOPPED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_concurrency() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut suite = TestSuite::new(
            "s",
            SuiteConfig {
                parallel: true,
                max_concurrency: 2,
                ..config()
            },
        );
        for i in 0..5 {
            let active = active.clone();
            let peak = peak.clone();
            suite = suite.with_case(TestCase::new(&format!("c{i}"), "c", move || {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Observation::observed(true))
                }
            }));
        }
        let outcome = run(suite).await;

        assert_eq!(outcome.results.len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_suite_runs_nothing() {
        let suite = TestSuite::new("s", config()).with_case(passing("a").with_dependencies(&["missing"]));
        assert!(Orchestrator::new(suite).run().await.is_err());
    }

    #[test]
    fn test_backoff_is_linear_with_jitter() {
        for attempt in 1..=3 {
            let delay = backoff(Duration::from_secs(1), attempt);
            let expected = f64::from(attempt) * 1000.0;
            let ms = delay.as_secs_f64() * 1000.0;
            assert!(ms >= expected * 0.9 - 1.0 && ms <= expected * 1.1 + 1.0, "{ms}");
        }
    }
}
