//! Multi-region consistency prober.
//!
//! One identity is authenticated against several regional deployments of the
//! identity provider. Region clients are created lazily, once per configured
//! region, and reused for the rest of the run.

use super::{AuthStatus, AuthenticationOutcome, AuthenticationProbe, ProbeOutcome, NO_CREDENTIAL};
use crate::backend::{cognito::CognitoClient, idp_endpoint, BackendError, IdentityProvider};
use crate::config::{RegionDescriptor, RegionRole, Simulated, WritePolicy};
use crate::fixtures::IdentityFixture;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const FAILOVER_STAGE: &str = "failover-execution";
pub const CONSISTENCY_STAGE: &str = "cross-region-consistency";

/// Builds the identity-provider client for one region.
pub trait ProviderFactory: Send + Sync {
    /// # Errors
    /// Returns `BackendError` if the client cannot be built.
    fn connect(&self, region: &RegionDescriptor) -> Result<Arc<dyn IdentityProvider>, BackendError>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&RegionDescriptor) -> Result<Arc<dyn IdentityProvider>, BackendError> + Send + Sync,
{
    fn connect(&self, region: &RegionDescriptor) -> Result<Arc<dyn IdentityProvider>, BackendError> {
        self(region)
    }
}

/// Cognito clients sharing one HTTP client.
pub struct CognitoFactory {
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl CognitoFactory {
    #[must_use]
    pub const fn new(client: reqwest::Client, endpoint: Option<Url>) -> Self {
        Self { client, endpoint }
    }
}

impl ProviderFactory for CognitoFactory {
    fn connect(&self, region: &RegionDescriptor) -> Result<Arc<dyn IdentityProvider>, BackendError> {
        let endpoint = idp_endpoint(&region.region_id, self.endpoint.as_ref())?;
        Ok(Arc::new(CognitoClient::new(
            self.client.clone(),
            endpoint,
            region.region_id.clone(),
            region.user_pool_id.clone(),
            region.client_id.clone(),
        )))
    }
}

pub struct RegionPool {
    regions: Vec<RegionDescriptor>,
    factory: Arc<dyn ProviderFactory>,
    clients: Mutex<HashMap<String, Arc<dyn IdentityProvider>>>,
}

impl RegionPool {
    #[must_use]
    pub fn new(regions: Vec<RegionDescriptor>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            regions,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    #[must_use]
    pub fn by_role(&self, role: RegionRole) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|region| region.role == role)
    }

    /// Probe for a configured region; `Ok(None)` when it is unconfigured.
    ///
    /// # Errors
    /// Returns `BackendError` if the region's client cannot be built.
    pub fn probe(&self, region: &RegionDescriptor) -> Result<Option<AuthenticationProbe>, BackendError> {
        if !region.is_configured() {
            return Ok(None);
        }

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = clients.get(&region.region_id) {
            return Ok(Some(AuthenticationProbe::new(provider.clone())));
        }

        debug!("connecting to {}", region.region_id);
        let provider = self.factory.connect(region)?;
        clients.insert(region.region_id.clone(), provider.clone());
        Ok(Some(AuthenticationProbe::new(provider)))
    }
}

/// One probe against one region, reduced to what a report needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionAttempt {
    pub region: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AuthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl RegionAttempt {
    fn skipped(region: &str, reason: impl Into<String>) -> Self {
        Self {
            region: region.to_string(),
            success: false,
            latency_ms: 0,
            status: None,
            error: None,
            skipped: Some(reason.into()),
        }
    }

    fn failed(region: &str, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            region: region.to_string(),
            success: false,
            latency_ms,
            status: None,
            error: Some(error.into()),
            skipped: None,
        }
    }

    fn from_outcome(outcome: &AuthenticationOutcome) -> Self {
        Self {
            region: outcome.region.clone(),
            success: outcome.succeeded(),
            latency_ms: outcome.latency_ms(),
            status: Some(outcome.status.clone()),
            error: None,
            skipped: None,
        }
    }
}

/// Compares session claims issued by two regions.
#[async_trait]
pub trait ConsistencyCheck: Send + Sync {
    async fn compare(
        &self,
        primary: &AuthenticationOutcome,
        secondary: &AuthenticationOutcome,
        policy: WritePolicy,
    ) -> Consistency;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Consistency {
    pub consistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Claim comparison is not performed against live tokens; this check passes
/// and records the policy that prevented it.
pub struct SafeguardedConsistency;

#[async_trait]
impl ConsistencyCheck for SafeguardedConsistency {
    async fn compare(
        &self,
        _primary: &AuthenticationOutcome,
        _secondary: &AuthenticationOutcome,
        policy: WritePolicy,
    ) -> Consistency {
        Consistency {
            consistent: true,
            reason: Some(policy.safeguard(CONSISTENCY_STAGE).reason),
        }
    }
}

#[derive(Debug)]
pub enum RegionCheck<T> {
    Skipped(String),
    Checked(T),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub primary: RegionAttempt,
    pub secondary: RegionAttempt,
    pub consistency: Consistency,
}

impl ConsistencyReport {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.primary.success && self.secondary.success && self.consistency.consistent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSweep {
    pub per_region: BTreeMap<String, RegionAttempt>,
    /// Regions left out because they are not configured.
    pub unconfigured: Vec<String>,
    pub successful_regions: usize,
    pub total_regions: usize,
    pub average_latency_ms: f64,
}

impl GlobalSweep {
    /// One healthy region is enough.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.successful_regions > 0
    }

    #[must_use]
    pub const fn consistent(&self) -> bool {
        self.successful_regions == self.total_regions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverReport {
    pub primary: RegionAttempt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<RegionAttempt>,
    /// The secondary was only tried because the primary failed.
    pub failover_executed: bool,
    /// The failover drill itself is never run live.
    pub drill: Simulated,
}

impl FailoverReport {
    #[must_use]
    pub fn success(&self) -> bool {
        self.primary.success || self.failover.as_ref().is_some_and(|attempt| attempt.success)
    }
}

/// Summary shape shared by the three regional checks in reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionDetails {
    pub primary_region: String,
    pub secondary_region: String,
    pub failover_tested: bool,
    pub consistency_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_regions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_regions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
}

impl From<&ConsistencyReport> for RegionDetails {
    fn from(report: &ConsistencyReport) -> Self {
        Self {
            primary_region: report.primary.region.clone(),
            secondary_region: report.secondary.region.clone(),
            failover_tested: false,
            consistency_verified: report.consistency.consistent,
            successful_regions: None,
            total_regions: None,
            average_latency_ms: None,
        }
    }
}

impl From<&GlobalSweep> for RegionDetails {
    fn from(sweep: &GlobalSweep) -> Self {
        Self {
            primary_region: sweep.per_region.keys().next().cloned().unwrap_or_default(),
            secondary_region: "multiple".to_string(),
            failover_tested: false,
            consistency_verified: sweep.consistent(),
            successful_regions: Some(sweep.successful_regions),
            total_regions: Some(sweep.total_regions),
            average_latency_ms: Some(sweep.average_latency_ms),
        }
    }
}

impl From<&FailoverReport> for RegionDetails {
    fn from(report: &FailoverReport) -> Self {
        Self {
            primary_region: report.primary.region.clone(),
            secondary_region: report
                .failover
                .as_ref()
                .map(|attempt| attempt.region.clone())
                .unwrap_or_default(),
            failover_tested: report.failover_executed,
            consistency_verified: report.success(),
            successful_regions: None,
            total_regions: None,
            average_latency_ms: None,
        }
    }
}

pub struct RegionProber {
    pool: Arc<RegionPool>,
    consistency: Arc<dyn ConsistencyCheck>,
}

impl RegionProber {
    #[must_use]
    pub fn new(pool: Arc<RegionPool>) -> Self {
        Self {
            pool,
            consistency: Arc::new(SafeguardedConsistency),
        }
    }

    #[must_use]
    pub fn with_consistency_check(mut self, check: Arc<dyn ConsistencyCheck>) -> Self {
        self.consistency = check;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<RegionPool> {
        &self.pool
    }

    /// Authenticate against the primary, then the secondary (sequentially),
    /// and compare the issued claims.
    #[instrument(skip_all, fields(identity = %identity.name))]
    pub async fn consistency(
        &self,
        identity: &IdentityFixture,
        policy: WritePolicy,
    ) -> RegionCheck<ConsistencyReport> {
        if !identity.has_secret() {
            return RegionCheck::Skipped(NO_CREDENTIAL.to_string());
        }
        let (Some(primary), Some(secondary)) = (
            self.pool.by_role(RegionRole::Primary),
            self.pool.by_role(RegionRole::Secondary),
        ) else {
            return RegionCheck::Skipped("primary or secondary region is not defined".to_string());
        };
        for region in [primary, secondary] {
            if !region.is_configured() {
                return RegionCheck::Skipped(format!("region {} is not configured", region.region_id));
            }
        }

        let (primary_attempt, primary_outcome) = attempt(&self.pool, primary, identity).await;
        let (secondary_attempt, secondary_outcome) = attempt(&self.pool, secondary, identity).await;

        let consistency = match (&primary_outcome, &secondary_outcome) {
            (Some(p), Some(s)) if p.succeeded() && s.succeeded() => {
                self.consistency.compare(p, s, policy).await
            }
            _ => Consistency {
                consistent: false,
                reason: Some("a region issued no token".to_string()),
            },
        };

        RegionCheck::Checked(ConsistencyReport {
            primary: primary_attempt,
            secondary: secondary_attempt,
            consistency,
        })
    }

    /// Authenticate against every configured region concurrently.
    #[instrument(skip_all, fields(identity = %identity.name))]
    pub async fn global_sweep(&self, identity: &Arc<IdentityFixture>) -> RegionCheck<GlobalSweep> {
        if !identity.has_secret() {
            return RegionCheck::Skipped(NO_CREDENTIAL.to_string());
        }

        let (configured, unconfigured): (Vec<&RegionDescriptor>, Vec<&RegionDescriptor>) =
            self.pool.regions().iter().partition(|region| region.is_configured());
        if configured.is_empty() {
            return RegionCheck::Skipped("no configured regions".to_string());
        }

        let mut set = JoinSet::new();
        for region in configured {
            let pool = self.pool.clone();
            let region = region.clone();
            let identity = identity.clone();
            set.spawn(async move { attempt(&pool, &region, &identity).await.0 });
        }

        let mut per_region = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(attempt) => {
                    per_region.insert(attempt.region.clone(), attempt);
                }
                Err(e) => warn!("regional probe task failed: {e}"),
            }
        }

        let successful_regions = per_region.values().filter(|a| a.success).count();
        let total_regions = per_region.len();
        #[allow(clippy::cast_precision_loss)]
        let average_latency_ms = if total_regions == 0 {
            0.0
        } else {
            per_region.values().map(|a| a.latency_ms as f64).sum::<f64>() / total_regions as f64
        };

        info!("{successful_regions}/{total_regions} regions authenticated");

        RegionCheck::Checked(GlobalSweep {
            per_region,
            unconfigured: unconfigured.iter().map(|r| r.region_id.clone()).collect(),
            successful_regions,
            total_regions,
            average_latency_ms,
        })
    }

    /// Try the primary; only if it fails, try the secondary once.
    #[instrument(skip_all, fields(identity = %identity.name))]
    pub async fn failover(&self, identity: &IdentityFixture, policy: WritePolicy) -> RegionCheck<FailoverReport> {
        if !identity.has_secret() {
            return RegionCheck::Skipped(NO_CREDENTIAL.to_string());
        }
        let Some(primary) = self.pool.by_role(RegionRole::Primary) else {
            return RegionCheck::Skipped("primary region is not defined".to_string());
        };
        if !primary.is_configured() {
            return RegionCheck::Skipped(format!("region {} is not configured", primary.region_id));
        }

        let (primary_attempt, _) = attempt(&self.pool, primary, identity).await;

        let failover = if primary_attempt.success {
            None
        } else {
            info!("primary region {} failed, trying failover", primary.region_id);
            Some(match self.pool.by_role(RegionRole::Secondary) {
                Some(secondary) => attempt(&self.pool, secondary, identity).await.0,
                None => RegionAttempt::skipped("", "secondary region is not defined"),
            })
        };

        RegionCheck::Checked(FailoverReport {
            primary: primary_attempt,
            failover_executed: failover.is_some(),
            failover,
            drill: policy.safeguard(FAILOVER_STAGE),
        })
    }
}

/// Probe one region; every failure is folded into the attempt.
async fn attempt(
    pool: &RegionPool,
    region: &RegionDescriptor,
    identity: &IdentityFixture,
) -> (RegionAttempt, Option<AuthenticationOutcome>) {
    let probe = match pool.probe(region) {
        Ok(Some(probe)) => probe,
        Ok(None) => {
            return (
                RegionAttempt::skipped(&region.region_id, "region not configured"),
                None,
            )
        }
        Err(e) => return (RegionAttempt::failed(&region.region_id, 0, e.to_string()), None),
    };

    let started = Instant::now();
    match probe.authenticate(identity).await {
        Ok(ProbeOutcome::Attempted(outcome)) => (RegionAttempt::from_outcome(&outcome), Some(outcome)),
        Ok(ProbeOutcome::Skipped(reason)) => (RegionAttempt::skipped(&region.region_id, reason), None),
        Err(e) => {
            warn!("{e}");
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            (RegionAttempt::failed(&region.region_id, latency_ms, e.to_string()), None)
        }
    }
}
