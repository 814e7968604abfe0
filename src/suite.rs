//! The production authentication suite.
//!
//! [`Harness`] owns every component a case needs (probe, validators, region
//! prober and batch plan) from construction, and [`Harness::suite`] turns it
//! into the dependency-ordered [`TestSuite`] the orchestrator runs.

use crate::auth::mfa::{check_mfa, MfaCheck};
use crate::auth::region::{CognitoFactory, RegionCheck, RegionDetails, RegionPool, RegionProber};
use crate::auth::session::SessionLifecycle;
use crate::auth::sid::SidValidator;
use crate::auth::{AuthStatus, AuthenticationOutcome, AuthenticationProbe, ProbeOutcome};
use crate::backend::cognito::CognitoClient;
use crate::backend::dynamo::DynamoSessionStore;
use crate::backend::{http_client, idp_endpoint, session_store_endpoint, BackendError, IdentityProvider, SessionStore};
use crate::config::{load_regions, ProductionConfig, WritePolicy};
use crate::engine::batch::{run_population, BatchPlan};
use crate::engine::{
    CaseError, ExpectedOutcome, Observation, Stopwatch, SuiteConfig, TestCase, TestResult, TestStatus, TestSuite,
    Timing,
};
use crate::fixtures::{FixtureRegistry, IdentityFixture};
use secrecy::SecretString;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub const SUITE_NAME: &str = "production-authentication";

pub const VALID_AUTH: &str = "auth-valid-001";
pub const INVALID_AUTH: &str = "auth-invalid-001";
pub const SESSION: &str = "auth-session-001";
pub const MFA: &str = "auth-mfa-001";
pub const FLOW: &str = "auth-flow-001";
pub const SID: &str = "auth-sid-comprehensive-001";
pub const MULTI_REGION: &str = "auth-multi-region-001";

/// Password used for the negative credential case.
pub const INVALID_PASSWORD: &str = "InvalidPassword123!";

const SID_CATEGORY: &str = "sid";
const REGION_CATEGORY: &str = "multi-region";
const TOKEN_REFRESH_STAGE: &str = "token-refresh";

/// One step of the end-to-end flow case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStep {
    pub step: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowStep {
    fn passed(step: &'static str) -> Self {
        Self {
            step,
            success: true,
            simulated: None,
            error: None,
        }
    }
}

fn sid_child_id(identity: &IdentityFixture) -> String {
    format!("sid-{}", identity.name)
}

fn observe(success: bool, error: Option<String>) -> Observation {
    match error {
        Some(error) if !success => Observation::observed(false).with_error(error),
        _ => Observation::observed(success),
    }
}

/// Parent observation over nested child results: skipped if every child
/// skipped, failed if any child failed.
fn aggregate(children: Vec<TestResult>, what: &str) -> Observation {
    if !children.is_empty() && children.iter().all(|c| c.status == TestStatus::Skipped) {
        return Observation::skipped(format!("every {what} check was skipped")).with_children(children);
    }

    let failed: Vec<&str> = children
        .iter()
        .filter(|c| c.status == TestStatus::Failed)
        .map(|c| c.test_name.as_str())
        .collect();
    let error = (!failed.is_empty()).then(|| {
        format!(
            "{} of {} {what} checks failed: {}",
            failed.len(),
            children.len(),
            failed.join(", ")
        )
    });

    observe(failed.is_empty(), error)
        .with_metadata("children", children.len())
        .with_children(children)
}

pub struct Harness {
    config: ProductionConfig,
    fixtures: FixtureRegistry,
    probe: AuthenticationProbe,
    lifecycle: SessionLifecycle,
    sid: SidValidator,
    regions: RegionProber,
    batch: BatchPlan,
}

impl Harness {
    #[must_use]
    pub fn new(
        config: ProductionConfig,
        fixtures: FixtureRegistry,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        regions: RegionProber,
    ) -> Self {
        Self {
            config,
            fixtures,
            probe: AuthenticationProbe::new(provider.clone()),
            lifecycle: SessionLifecycle::new(provider.clone(), store),
            sid: SidValidator::new(provider),
            regions,
            batch: BatchPlan::default(),
        }
    }

    /// Wire the harness to the live Cognito and DynamoDB endpoints described
    /// by `config`.
    ///
    /// # Errors
    /// Returns `BackendError` if the HTTP client or an endpoint URL cannot be
    /// built.
    pub fn connect(config: ProductionConfig, fixtures: FixtureRegistry) -> Result<Self, BackendError> {
        let client = http_client()?;

        let provider: Arc<dyn IdentityProvider> = Arc::new(CognitoClient::new(
            client.clone(),
            idp_endpoint(&config.region, config.idp_endpoint.as_ref())?,
            config.region.clone(),
            config.user_pool_id.clone(),
            config.client_id.clone(),
        ));
        let store: Arc<dyn SessionStore> = Arc::new(DynamoSessionStore::new(
            client.clone(),
            session_store_endpoint(&config.region, config.session_store_endpoint.as_ref())?,
            config.session_table.clone(),
        ));

        let factory = CognitoFactory::new(client, config.idp_endpoint.clone());
        let pool = RegionPool::new(load_regions(&config), Arc::new(factory));

        Ok(Self::new(
            config,
            fixtures,
            provider,
            store,
            RegionProber::new(Arc::new(pool)),
        ))
    }

    #[must_use]
    pub const fn with_batch_plan(mut self, batch: BatchPlan) -> Self {
        self.batch = batch;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ProductionConfig {
        &self.config
    }

    #[must_use]
    pub const fn fixtures(&self) -> &FixtureRegistry {
        &self.fixtures
    }

    const fn policy(&self) -> WritePolicy {
        self.config.write_policy
    }

    /// The seven authentication cases with their timeouts, retry budgets and
    /// dependencies.
    #[must_use]
    pub fn suite(self: &Arc<Self>, config: SuiteConfig) -> TestSuite {
        TestSuite::new(SUITE_NAME, config)
            .with_case(
                TestCase::new(VALID_AUTH, "Valid credential authentication", self.bind(|h| async move {
                    h.valid_authentication().await
                }))
                .with_description("Sign in with a configured credential and create a session")
                .with_timeout(Duration::from_secs(30))
                .with_retries(2),
            )
            .with_case(
                TestCase::new(INVALID_AUTH, "Invalid credential rejection", self.bind(|h| async move {
                    h.invalid_authentication().await
                }))
                .with_description("A wrong password must be refused")
                .with_timeout(Duration::from_secs(30))
                .with_retries(2)
                .with_expected(ExpectedOutcome::ShouldFail),
            )
            .with_case(
                TestCase::new(SESSION, "Session lifecycle", self.bind(|h| async move {
                    h.session_lifecycle().await
                }))
                .with_description("Create, validate and terminate a session")
                .with_timeout(Duration::from_secs(60))
                .with_retries(1)
                .with_dependencies(&[VALID_AUTH]),
            )
            .with_case(
                TestCase::new(MFA, "MFA challenge", self.bind(|h| async move { h.mfa_challenge().await }))
                    .with_description("An MFA-enrolled identity must be challenged")
                    .with_timeout(Duration::from_secs(45))
                    .with_retries(1),
            )
            .with_case(
                TestCase::new(FLOW, "Authentication flow integrity", self.bind(|h| async move {
                    h.authentication_flow().await
                }))
                .with_description("Sign in, read the user, refresh and sign out")
                .with_timeout(Duration::from_secs(90))
                .with_retries(1)
                .with_dependencies(&[VALID_AUTH, SESSION]),
            )
            .with_case(
                TestCase::new(SID, "SID and permission validation", self.bind(|h| async move {
                    h.sid_comprehensive().await
                }))
                .with_category(SID_CATEGORY)
                .with_description("Identity, permission and resource checks for every SID identity")
                .with_timeout(Duration::from_secs(300))
                .with_retries(1)
                .with_dependencies(&[VALID_AUTH]),
            )
            .with_case(
                TestCase::new(MULTI_REGION, "Multi-region authentication", self.bind(|h| async move {
                    h.multi_region().await
                }))
                .with_category(REGION_CATEGORY)
                .with_description("Cross-region consistency, global sweep and failover")
                .with_timeout(Duration::from_secs(180))
                .with_retries(1)
                .with_dependencies(&[VALID_AUTH]),
            )
    }

    fn bind<F, Fut>(self: &Arc<Self>, run: F) -> impl Fn() -> Fut + Send + Sync + 'static
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Observation, CaseError>> + Send + 'static,
    {
        let harness = self.clone();
        move || run(harness.clone())
    }

    /// `Err` carries the observation to return when no usable outcome exists.
    async fn sign_in(&self, identity: &IdentityFixture) -> Result<Result<AuthenticationOutcome, Observation>, CaseError> {
        Ok(match self.probe.authenticate(identity).await? {
            ProbeOutcome::Skipped(reason) => Err(Observation::skipped(reason)),
            ProbeOutcome::Attempted(outcome) if !outcome.succeeded() => Err(Observation::failed(format!(
                "{}: {}",
                outcome.identity, outcome.status
            ))
            .with_auth(outcome.details())),
            ProbeOutcome::Attempted(outcome) => Ok(outcome),
        })
    }

    #[instrument(skip(self))]
    async fn valid_authentication(&self) -> Result<Observation, CaseError> {
        let outcome = match self.sign_in(&self.fixtures.primary).await? {
            Ok(outcome) => outcome,
            Err(observation) => return Ok(observation),
        };

        let (created, record) = self.lifecycle.create(&outcome.identity, self.policy()).await;
        let error = created.error.as_ref().map(|e| format!("session-create: {e}"));

        Ok(observe(created.success, error)
            .with_auth(outcome.details())
            .with_metadata("sessionCreate", &created)
            .with_metadata("sessionExpiresAt", record.expires_at))
    }

    #[instrument(skip(self))]
    async fn invalid_authentication(&self) -> Result<Observation, CaseError> {
        let identity =
            IdentityFixture::new(&self.fixtures.primary.name).with_secret(Some(INVALID_PASSWORD.to_string()));

        Ok(match self.probe.authenticate(&identity).await? {
            ProbeOutcome::Skipped(reason) => Observation::skipped(reason),
            ProbeOutcome::Attempted(outcome) => {
                info!("invalid credential: {}", outcome.status);
                // Only an explicit rejection counts as refusal; a challenge or
                // a token-less 200 means the wrong password was accepted.
                let observation = match &outcome.status {
                    AuthStatus::Rejected(_) => Observation::observed(false),
                    accepted => Observation::observed(true)
                        .with_error(format!("invalid credential was not rejected: {accepted}")),
                };
                observation.with_auth(outcome.details())
            }
        })
    }

    #[instrument(skip(self))]
    async fn session_lifecycle(&self) -> Result<Observation, CaseError> {
        let outcome = match self.sign_in(&self.fixtures.primary).await? {
            Ok(outcome) => outcome,
            Err(observation) => return Ok(observation),
        };

        let session = self.lifecycle.run(&outcome, self.policy()).await;
        let failures = session.failures();
        let error = (!failures.is_empty()).then(|| failures.join("; "));

        Ok(observe(session.succeeded(), error)
            .with_auth(outcome.details())
            .with_session(session))
    }

    #[instrument(skip(self))]
    async fn mfa_challenge(&self) -> Result<Observation, CaseError> {
        Ok(match check_mfa(&self.probe, &self.fixtures.mfa).await? {
            MfaCheck::Skipped(reason) => Observation::skipped(reason),
            MfaCheck::Checked { mfa, auth } => {
                let error = (!mfa.succeeded()).then(|| format!("no MFA challenge returned ({})", auth.status));
                observe(mfa.succeeded(), error).with_auth(auth).with_mfa(mfa)
            }
        })
    }

    #[instrument(skip(self))]
    async fn authentication_flow(&self) -> Result<Observation, CaseError> {
        let outcome = match self.sign_in(&self.fixtures.primary).await? {
            Ok(outcome) => outcome,
            Err(observation) => return Ok(observation),
        };
        let Some(token) = outcome.access_token.as_ref() else {
            return Ok(Observation::failed("no access token").with_auth(outcome.details()));
        };

        let mut steps = vec![FlowStep::passed("authenticate")];
        steps.push(self.read_user(token).await);

        let refresh = self.policy().safeguard(TOKEN_REFRESH_STAGE);
        steps.push(FlowStep {
            simulated: Some(refresh.reason),
            ..FlowStep::passed("refresh")
        });

        let terminated = self.lifecycle.terminate(token, self.policy()).await;
        steps.push(FlowStep {
            step: "sign-out",
            success: terminated.success,
            simulated: terminated.simulated,
            error: terminated.error,
        });

        let failed: Vec<String> = steps
            .iter()
            .filter(|step| !step.success)
            .map(|step| format!("{}: {}", step.step, step.error.as_deref().unwrap_or("failed")))
            .collect();
        let error = (!failed.is_empty()).then(|| failed.join("; "));

        Ok(observe(failed.is_empty(), error)
            .with_auth(outcome.details())
            .with_metadata("steps", &steps))
    }

    async fn read_user(&self, token: &SecretString) -> FlowStep {
        match self.probe.provider().get_user(token).await {
            Ok(user) if !user.username.is_empty() => FlowStep::passed("get-user"),
            Ok(_) => FlowStep {
                success: false,
                error: Some("provider returned an empty username".to_string()),
                ..FlowStep::passed("get-user")
            },
            Err(e) => FlowStep {
                success: false,
                error: Some(e.to_string()),
                ..FlowStep::passed("get-user")
            },
        }
    }

    #[instrument(skip(self))]
    async fn sid_comprehensive(self: Arc<Self>) -> Result<Observation, CaseError> {
        let mut children = vec![
            self.sid_check(&self.fixtures.sid_user).await,
            self.sid_check(&self.fixtures.admin).await,
        ];

        let population = run_population(
            &self.fixtures.numbered,
            self.batch,
            |identity| {
                let harness = self.clone();
                async move { harness.sid_check(&identity).await }
            },
            |identity| {
                TestResult::failed(
                    &sid_child_id(identity),
                    &identity.name,
                    SID_CATEGORY,
                    "SID check panicked",
                    Timing::instant(),
                )
            },
        )
        .await;
        info!(
            "numbered population: {} identities in {} batches",
            population.results.len(),
            population.batch_sizes.len()
        );
        children.extend(population.results);

        Ok(aggregate(children, "SID"))
    }

    /// One identity's SID checks as a nested result.
    async fn sid_check(&self, identity: &IdentityFixture) -> TestResult {
        let id = sid_child_id(identity);
        let watch = Stopwatch::start();

        let observation = match self.probe.authenticate(identity).await {
            Err(e) => Observation::failed(e.to_string()),
            Ok(ProbeOutcome::Skipped(reason)) => Observation::skipped(reason),
            Ok(ProbeOutcome::Attempted(outcome)) => {
                let details = self.sid.validate(identity, &outcome, self.policy()).await;
                observe(details.valid(), details.reason())
                    .with_auth(outcome.details())
                    .with_sid(details)
            }
        };

        TestResult::conclude(
            &id,
            &identity.name,
            SID_CATEGORY,
            ExpectedOutcome::ShouldSucceed,
            observation,
            watch.stop(),
        )
    }

    #[instrument(skip(self))]
    async fn multi_region(&self) -> Result<Observation, CaseError> {
        let identity = &self.fixtures.sid_user;
        let policy = self.policy();

        let watch = Stopwatch::start();
        let consistency = match self.regions.consistency(identity, policy).await {
            RegionCheck::Skipped(reason) => Observation::skipped(reason),
            RegionCheck::Checked(report) => {
                let error = (!report.success()).then(|| {
                    report
                        .consistency
                        .reason
                        .clone()
                        .unwrap_or_else(|| "regions disagree".to_string())
                });
                observe(report.success(), error)
                    .with_region(RegionDetails::from(&report))
                    .with_metadata("report", &report)
            }
        };
        let consistency = region_child("region-consistency", "Cross-region consistency", consistency, watch);

        let watch = Stopwatch::start();
        let sweep = match self.regions.global_sweep(identity).await {
            RegionCheck::Skipped(reason) => Observation::skipped(reason),
            RegionCheck::Checked(sweep) => {
                let error = (!sweep.success()).then(|| "no region authenticated".to_string());
                observe(sweep.success(), error)
                    .with_region(RegionDetails::from(&sweep))
                    .with_metadata("report", &sweep)
            }
        };
        let sweep = region_child("region-global", "Global region sweep", sweep, watch);

        let watch = Stopwatch::start();
        let failover = match self.regions.failover(identity, policy).await {
            RegionCheck::Skipped(reason) => Observation::skipped(reason),
            RegionCheck::Checked(report) => {
                let error = (!report.success()).then(|| "primary and failover regions both failed".to_string());
                observe(report.success(), error)
                    .with_region(RegionDetails::from(&report))
                    .with_metadata("report", &report)
            }
        };
        let failover = region_child("region-failover", "Regional failover", failover, watch);

        Ok(aggregate(vec![consistency, sweep, failover], "regional"))
    }
}

fn region_child(id: &str, name: &str, observation: Observation, watch: Stopwatch) -> TestResult {
    TestResult::conclude(
        id,
        name,
        REGION_CATEGORY,
        ExpectedOutcome::ShouldSucceed,
        observation,
        watch.stop(),
    )
}

/// Default suite execution: sequential, continue on error.
#[must_use]
pub fn default_suite_config() -> SuiteConfig {
    SuiteConfig::default()
}
