//! Probing an identity population in fixed-size batches.

use super::TestResult;
use crate::fixtures::IdentityFixture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub delay: Duration,
}

impl Default for BatchPlan {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delay: DEFAULT_BATCH_DELAY,
        }
    }
}

impl BatchPlan {
    #[must_use]
    pub const fn new(batch_size: usize, delay: Duration) -> Self {
        Self { batch_size, delay }
    }

    fn size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Debug, Default)]
pub struct PopulationRun {
    /// One result per identity, in population order.
    pub results: Vec<TestResult>,
    pub batch_sizes: Vec<usize>,
    pub delays: usize,
}

/// Run `probe` for every identity, `plan.batch_size` at a time, pausing
/// `plan.delay` between batches. A probe that panics is replaced by
/// `on_panic(identity)`, so the failure stays keyed like the result it
/// stands in for.
pub async fn run_population<F, Fut, P>(
    identities: &[Arc<IdentityFixture>],
    plan: BatchPlan,
    probe: F,
    on_panic: P,
) -> PopulationRun
where
    F: Fn(Arc<IdentityFixture>) -> Fut,
    Fut: Future<Output = TestResult> + Send + 'static,
    P: Fn(&IdentityFixture) -> TestResult,
{
    let mut run = PopulationRun::default();
    let batches: Vec<&[Arc<IdentityFixture>]> = identities.chunks(plan.size()).collect();
    let total = batches.len();

    for (number, batch) in batches.into_iter().enumerate() {
        debug!("batch {}/{total}: {} identities", number + 1, batch.len());
        run.batch_sizes.push(batch.len());

        let mut tasks = JoinSet::new();
        for (slot, identity) in batch.iter().enumerate() {
            let future = probe(identity.clone());
            tasks.spawn(async move { (slot, future.await) });
        }

        let mut slots: Vec<Option<TestResult>> = vec![None; batch.len()];
        while let Some(joined) = tasks.join_next().await {
            if let Ok((slot, result)) = joined {
                slots[slot] = Some(result);
            }
        }

        for (slot, identity) in batch.iter().enumerate() {
            let result = slots[slot].take().unwrap_or_else(|| on_panic(identity));
            run.results.push(result);
        }

        if number + 1 < total {
            run.delays += 1;
            sleep(plan.delay).await;
        }
    }

    info!(
        "population of {} probed in {} batches",
        identities.len(),
        run.batch_sizes.len()
    );
    run
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{ExpectedOutcome, Observation, TestStatus, Timing};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn population(n: usize) -> Vec<Arc<IdentityFixture>> {
        (0..n)
            .map(|i| Arc::new(IdentityFixture::new(&format!("testuser{i}"))))
            .collect()
    }

    fn panicked(identity: &IdentityFixture) -> TestResult {
        TestResult::failed(
            &format!("sid-{}", identity.name),
            &identity.name,
            "sid",
            "probe panicked",
            Timing::instant(),
        )
    }

    fn pass(identity: &IdentityFixture) -> TestResult {
        TestResult::conclude(
            &identity.name,
            &identity.name,
            "sid",
            ExpectedOutcome::ShouldSucceed,
            Observation::observed(true),
            Timing::instant(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_and_delays() {
        let identities = population(10);
        let run = run_population(&identities, BatchPlan::new(3, Duration::from_secs(1)), |identity| async move {
            pass(&identity)
        }, panicked)
        .await;

        assert_eq!(run.batch_sizes, vec![3, 3, 3, 1]);
        assert_eq!(run.delays, 3);
        assert_eq!(run.results.len(), 10);
        let names: Vec<&str> = run.results.iter().map(|r| r.test_id.as_str()).collect();
        assert_eq!(names[0], "testuser0");
        assert_eq!(names[9], "testuser9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_members_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let identities = population(4);
        let run = run_population(&identities, BatchPlan::new(2, Duration::ZERO), |identity| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                pass(&identity)
            }
        }, panicked)
        .await;

        assert_eq!(run.results.len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_member_fails_only_its_identity() {
        let identities = population(3);
        let run = run_population(&identities, BatchPlan::new(3, Duration::ZERO), |identity| async move {
            assert!(identity.name != "testuser1", "boom");
            pass(&identity)
        }, panicked)
        .await;

        let statuses: Vec<TestStatus> = run.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![TestStatus::Completed, TestStatus::Failed, TestStatus::Completed]
        );
        assert_eq!(run.results[1].test_id, "sid-testuser1");
        assert_eq!(run.results[1].category, "sid");
        assert_eq!(run.results[1].error.as_deref(), Some("probe panicked"));
    }

    #[test]
    fn test_default_plan() {
        let plan = BatchPlan::default();
        assert_eq!(plan.batch_size, 3);
        assert_eq!(plan.delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_population() {
        let run = run_population(&[], BatchPlan::default(), |identity| async move { pass(&identity) }, panicked).await;
        assert!(run.results.is_empty());
        assert_eq!(run.delays, 0);
    }
}
