//! End-to-end job execution.
//!
//! Routing → budget admission → circuit breaker → (serializer, for the
//! exclusive backends) → backend → quality gate. Every decision is driven
//! through the [`JobLifecycle`] state machine and recorded in the result.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::{Artifact, Backend, BackendSet, ProduceRequest};
use crate::circuit::{CircuitBreaker, CircuitRegistry, CircuitStatus};
use crate::config::{DocpilotConfig, QualityConfig};
use crate::cost::{BudgetState, CallOutcome, CostEstimator, CostGovernor, FlatRateEstimator};
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::experiment::{VariantScorer, WeightedScorer, pick_winner};
use crate::fallback::{FallbackQueue, FallbackTask};
use crate::quality::{Attempt, QualityGate};
use crate::router::{BackendKind, RouteDecision, Router};
use crate::serializer::ExecutionSerializer;
use crate::state_machine::{
    ExecutionResult, ExecutionStatus, ExperimentSummary, JobLifecycle, JobSpec, LifecycleEvent,
    ResultMetadata, RunContext, Transition, VariantOutcome,
};
use crate::validator::{ProcessValidator, Validator};

/// Task type written to the fallback queue for deferred backend calls.
pub const DEFERRED_PRODUCE: &str = "deferred_produce";

/// Process-wide shared state. Built once at start and handed to the
/// orchestrator; budgets and circuits are only mutated through these.
#[derive(Debug)]
pub struct Services {
    pub governor: CostGovernor,
    pub circuits: CircuitRegistry,
    pub fallback: FallbackQueue,
    pub serializer: ExecutionSerializer,
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub budget: BudgetState,
    pub circuits: Vec<CircuitStatus>,
    pub fallback_pending: usize,
    pub fallback_path: String,
}

impl Services {
    pub fn new(
        governor: CostGovernor,
        circuits: CircuitRegistry,
        fallback: FallbackQueue,
        serializer: ExecutionSerializer,
    ) -> Self {
        Self {
            governor,
            circuits,
            fallback,
            serializer,
        }
    }

    pub fn from_config(config: &DocpilotConfig) -> Result<Self> {
        let estimator: Arc<dyn CostEstimator> =
            Arc::new(FlatRateEstimator::from_config(&config.costs));
        let governor = match &config.ledger.path {
            Some(path) => CostGovernor::open(config.budget.clone(), estimator, path)?,
            None => CostGovernor::new(config.budget.clone(), estimator),
        };
        Ok(Self::new(
            governor,
            CircuitRegistry::new(config.circuit_breaker.clone()),
            FallbackQueue::new(config.fallback.queue_path.clone()),
            ExecutionSerializer::new(),
        ))
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus {
            budget: self.governor.state(),
            circuits: self.circuits.statuses(),
            fallback_pending: self.fallback.pending().await?.len(),
            fallback_path: self.fallback.path().display().to_string(),
        })
    }
}

/// Drives jobs through routing, admission, execution and validation.
pub struct JobOrchestrator {
    router: Router,
    backends: BackendSet,
    validator: Arc<dyn Validator>,
    /// Stricter validator for world-class jobs produced by the serverless backend.
    authoritative: Arc<dyn Validator>,
    gate: QualityGate,
    scorer: Arc<dyn VariantScorer>,
    services: Arc<Services>,
}

impl JobOrchestrator {
    pub fn new(
        router: Router,
        backends: BackendSet,
        validator: Arc<dyn Validator>,
        authoritative: Arc<dyn Validator>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            router,
            backends,
            validator,
            authoritative,
            gate: QualityGate::new(QualityConfig::default().validate_timeout()),
            scorer: Arc::new(WeightedScorer::default()),
            services,
        }
    }

    pub fn with_quality_gate(mut self, gate: QualityGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn VariantScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn from_config(config: &DocpilotConfig) -> Result<Self> {
        let services = Arc::new(Services::from_config(config)?);
        let timeout = config.quality.validate_timeout();
        let validator = Arc::new(ProcessValidator::new(
            "validator",
            config.validator.command.clone(),
            timeout,
        ));
        let authoritative = Arc::new(ProcessValidator::new(
            "authoritative-validator",
            config.validator.authoritative_command.clone(),
            timeout,
        ));
        Ok(Self::new(
            Router::from_config(&config.router),
            BackendSet::from_config(config)?,
            validator,
            authoritative,
            services,
        )
        .with_quality_gate(QualityGate::new(timeout))
        .with_scorer(Arc::new(WeightedScorer::from_config(&config.experiment))))
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Routing decision for `job` without executing anything.
    pub fn route(&self, job: &JobSpec) -> Result<RouteDecision> {
        self.router.route(job)
    }

    /// Runs a job under a fresh run id.
    pub async fn execute(&self, job: &JobSpec) -> Result<ExecutionResult> {
        self.execute_run(job, &RunContext::new_run_id()).await
    }

    /// Runs a job under `run_id`, as an experiment when it declares variants.
    ///
    /// Cost records and fallback tasks of the run carry this id whether it
    /// succeeds or not. Experiment variants run as `<run_id>-<variant>`.
    pub async fn execute_run(&self, job: &JobSpec, run_id: &str) -> Result<ExecutionResult> {
        job.validate()?;
        if job.runs_experiment() {
            self.execute_experiment(job, run_id).await
        } else {
            self.execute_single(job, run_id).await
        }
    }

    /// One job through the full pipeline.
    pub async fn execute_single(&self, job: &JobSpec, run_id: &str) -> Result<ExecutionResult> {
        let decision = self.router.route(job)?;
        let backend = self.backends.get(decision.backend)?;
        let threshold = QualityGate::effective_threshold(job);
        let ctx = RunContext::new(job, decision, threshold, run_id);
        let lifecycle = Mutex::new(JobLifecycle::new());
        info!(
            job_id = %ctx.job_id,
            run_id = %ctx.run_id,
            backend = %ctx.backend,
            reason = %ctx.route.reason,
            threshold,
            "job routed"
        );

        let breaker = self.services.circuits.breaker(backend.service());
        let (ctx_ref, backend_ref, breaker_ref, lifecycle_ref) =
            (&ctx, backend.as_ref(), breaker.as_ref(), &lifecycle);
        let gated = self
            .gate
            .enforce(
                job,
                backend.supports_correction(),
                self.validator.as_ref(),
                move |attempt| {
                    self.attempt(ctx_ref, job, backend_ref, breaker_ref, lifecycle_ref, attempt)
                },
            )
            .await;

        let outcome = match gated {
            Ok(outcome) => outcome,
            Err(e) => {
                fail(&lifecycle, &e, &ctx.run_id);
                warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, error = %e, "job failed");
                return Err(e);
            }
        };
        advance(
            &lifecycle,
            LifecycleEvent::Pass {
                retried: outcome.auto_fix_applied,
            },
            &ctx.run_id,
        );

        let authoritative_qa = if job.mode.world_class && ctx.backend == BackendKind::Serverless {
            info!(run_id = %ctx.run_id, "world-class job on serverless backend, running authoritative validation");
            let confirmed = self
                .services
                .serializer
                .run_exclusive(self.gate.confirm(
                    self.authoritative.as_ref(),
                    &outcome.artifact.output_ref,
                    threshold,
                ))
                .await;
            match confirmed {
                Ok(report) => Some(report),
                Err(e) => {
                    fail(&lifecycle, &e, &ctx.run_id);
                    warn!(job_id = %ctx.job_id, run_id = %ctx.run_id, error = %e, "authoritative validation failed");
                    return Err(e);
                }
            }
        } else {
            None
        };

        let completed_at = Utc::now();
        let state_history = lifecycle
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .history();
        let status = if outcome.auto_fix_applied {
            ExecutionStatus::PassedAfterAutoFix
        } else {
            ExecutionStatus::Passed
        };
        info!(
            job_id = %ctx.job_id,
            run_id = %ctx.run_id,
            score = outcome.final_score,
            auto_fix = outcome.auto_fix_applied,
            "job passed"
        );

        Ok(ExecutionResult {
            status,
            output_ref: outcome.artifact.output_ref.clone(),
            metadata: ResultMetadata {
                cost: self.services.governor.run_spend(&ctx.run_id),
                backend: ctx.backend,
                threshold,
                qa: outcome.report,
                auto_fix_applied: outcome.auto_fix_applied,
                first_attempt_score: outcome.first_attempt_score,
                final_score: outcome.final_score,
                attempt_scores: outcome.attempt_scores,
                authoritative_qa,
                workflow_trace: outcome.artifact.steps,
                state_history,
                duration_ms: (completed_at - ctx.started_at).num_milliseconds(),
                completed_at,
                started_at: ctx.started_at,
                run_id: ctx.run_id,
                job_id: ctx.job_id,
                route: ctx.route,
                experiment: None,
            },
        })
    }

    /// One production attempt: admission, breaker, serializer, backend,
    /// then the cost record.
    async fn attempt(
        &self,
        ctx: &RunContext,
        job: &JobSpec,
        backend: &dyn Backend,
        breaker: &CircuitBreaker,
        lifecycle: &Mutex<JobLifecycle>,
        attempt: Attempt,
    ) -> Result<Artifact> {
        let operation = attempt.operation();
        let admission = if backend.metered() {
            match self
                .services
                .governor
                .admit(backend.service(), operation, &ctx.run_id)
            {
                Ok(admission) => Some(admission),
                Err(e) => {
                    advance(lifecycle, LifecycleEvent::RejectBudget, &ctx.run_id);
                    return Err(e);
                }
            }
        } else {
            None
        };
        advance(lifecycle, LifecycleEvent::Admit, &ctx.run_id);
        advance(lifecycle, LifecycleEvent::Start, &ctx.run_id);

        let request = ProduceRequest {
            job,
            run_id: &ctx.run_id,
            attempt,
        };
        let timed = async {
            let started = Instant::now();
            let result = breaker.execute(backend.produce(&request)).await;
            Ok::<_, OrchestratorError>((result, started.elapsed().as_millis() as u64))
        };
        let (result, latency_ms) = if backend.kind().is_exclusive() {
            // An open breaker rejects without waiting behind the queue.
            match breaker.check() {
                Ok(()) => self.services.serializer.run_exclusive(timed).await?,
                Err(e) => (Err(e), 0),
            }
        } else {
            timed.await?
        };

        match result {
            Err(e @ OrchestratorError::CircuitOpen { .. }) => {
                drop(admission);
                advance(lifecycle, LifecycleEvent::RejectCircuit, &ctx.run_id);
                let task = FallbackTask::new(
                    DEFERRED_PRODUCE,
                    backend.service(),
                    operation,
                    json!({
                        "jobId": job.job_id,
                        "runId": ctx.run_id,
                        "backend": backend.kind(),
                        "attempt": attempt,
                        "job": job,
                    }),
                );
                self.services.fallback.enqueue(&task).await?;
                Err(e)
            }
            result => {
                if let Some(admission) = admission {
                    let actual = match &result {
                        Ok(artifact) => artifact.cost.unwrap_or(admission.estimated_cost()),
                        Err(_) => admission.estimated_cost(),
                    };
                    let outcome = CallOutcome {
                        success: result.is_ok(),
                        latency_ms,
                    };
                    self.services.governor.record_cost(admission, actual, outcome);
                }
                result
            }
        }
    }

    /// Runs every variant through the full pipeline and returns the winner's
    /// result, annotated with the whole comparison.
    async fn execute_experiment(&self, job: &JobSpec, run_id: &str) -> Result<ExecutionResult> {
        let variants = job
            .experiment
            .as_ref()
            .map(|e| e.variants.as_slice())
            .unwrap_or_default();
        info!(job_id = %job.job_id, variants = variants.len(), "running experiment");

        let mut outcomes = Vec::with_capacity(variants.len());
        let mut results = Vec::with_capacity(variants.len());
        let mut first_error = None;

        for spec in variants {
            let variant = job.variant(spec);
            let variant_run_id = format!("{run_id}-{}", spec.name);
            match self.execute_single(&variant, &variant_run_id).await {
                Ok(result) => {
                    let composite = self.scorer.score(&result);
                    debug!(variant = %spec.name, composite, "variant scored");
                    outcomes.push(VariantOutcome {
                        name: spec.name.clone(),
                        job_id: variant.job_id,
                        run_id: Some(result.metadata.run_id.clone()),
                        score: Some(result.metadata.final_score),
                        composite: Some(composite),
                        error: None,
                    });
                    results.push(Some(result));
                }
                Err(e) => {
                    warn!(variant = %spec.name, error = %e, "variant failed");
                    outcomes.push(VariantOutcome {
                        name: spec.name.clone(),
                        job_id: variant.job_id,
                        run_id: None,
                        score: None,
                        composite: None,
                        error: Some(e.to_string()),
                    });
                    results.push(None);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let composites: Vec<Option<f64>> = outcomes.iter().map(|o| o.composite).collect();
        let Some(index) = pick_winner(&composites) else {
            return Err(first_error.unwrap_or_else(|| {
                OrchestratorError::Config(format!("experiment for {} has no variants", job.job_id))
            }));
        };
        let Some(mut result) = results.swap_remove(index) else {
            return Err(OrchestratorError::Config("winning variant has no result".into()));
        };

        let winner = outcomes[index].name.clone();
        info!(job_id = %job.job_id, winner = %winner, "experiment winner selected");
        result.metadata.experiment = Some(ExperimentSummary {
            winner,
            variants: outcomes,
        });
        Ok(result)
    }
}

fn advance(lifecycle: &Mutex<JobLifecycle>, event: LifecycleEvent, run_id: &str) {
    let mut lifecycle = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
    match lifecycle.apply(event) {
        Transition::Next(state) => debug!(run_id, %state, "state transition"),
        Transition::Stay(_) => {}
        Transition::Invalid { from, event } => {
            debug!(run_id, %from, ?event, "ignored lifecycle event")
        }
    }
}

/// Moves a still-running lifecycle to its failure state. Rejections have
/// already been recorded at the point they happened.
fn fail(lifecycle: &Mutex<JobLifecycle>, error: &OrchestratorError, run_id: &str) {
    let event = match error.kind() {
        Some(ErrorKind::ValidationFailed) => LifecycleEvent::FailValidation,
        _ => LifecycleEvent::Fail,
    };
    advance(lifecycle, event, run_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, CircuitBreakerConfig};
    use crate::reports::RunReport;
    use crate::router::{Field, Operator, Predicate, RouteReason, RoutingRule, RuleValue};
    use crate::state_machine::{
        ExperimentSpec, JobState, OutputQuality, VariantSpec, WorkflowSpec,
    };
    use crate::validator::ValidatorResponse;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockBackend {
        kind: BackendKind,
        service: &'static str,
        supports_correction: bool,
        metered: bool,
        fail_with: Option<fn() -> OrchestratorError>,
        cost: Option<f64>,
        calls: AtomicU32,
    }

    impl MockBackend {
        fn ok(kind: BackendKind, service: &'static str) -> Self {
            Self {
                kind,
                service,
                supports_correction: true,
                metered: true,
                fail_with: None,
                cost: None,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(kind: BackendKind, service: &'static str, error: fn() -> OrchestratorError) -> Self {
            Self {
                fail_with: Some(error),
                ..Self::ok(kind, service)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn service(&self) -> &str {
            self.service
        }

        fn supports_correction(&self) -> bool {
            self.supports_correction
        }

        fn metered(&self) -> bool {
            self.metered
        }

        async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.fail_with {
                return Err(error());
            }
            Ok(Artifact {
                output_ref: format!(
                    "{}/{}-{}.pdf",
                    self.service, request.job.job_id, request.attempt.number
                ),
                cost: self.cost,
                steps: Vec::new(),
            })
        }
    }

    /// Sleeps inside `produce` and tracks how many calls overlap. Backends
    /// sharing counters are measured together.
    struct OverlapBackend {
        kind: BackendKind,
        service: &'static str,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl OverlapBackend {
        fn new(
            kind: BackendKind,
            service: &'static str,
            counters: &(Arc<AtomicUsize>, Arc<AtomicUsize>),
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                service,
                in_flight: Arc::clone(&counters.0),
                max_in_flight: Arc::clone(&counters.1),
            })
        }
    }

    #[async_trait]
    impl Backend for OverlapBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn service(&self) -> &str {
            self.service
        }

        fn supports_correction(&self) -> bool {
            false
        }

        async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Artifact::new(format!("{}/{}.pdf", self.service, request.job.job_id)))
        }
    }

    /// Scores in order, then `fallback` forever.
    struct ScriptedValidator {
        scores: Mutex<VecDeque<f64>>,
        fallback: f64,
        thresholds: Mutex<Vec<f64>>,
    }

    impl ScriptedValidator {
        fn new(scores: &[f64], fallback: f64) -> Arc<Self> {
            Arc::new(Self {
                scores: Mutex::new(scores.iter().copied().collect()),
                fallback,
                thresholds: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Validator for ScriptedValidator {
        async fn validate(&self, _artifact: &str, threshold: f64) -> Result<ValidatorResponse> {
            self.thresholds.lock().unwrap().push(threshold);
            let score = self.scores.lock().unwrap().pop_front().unwrap_or(self.fallback);
            Ok(ValidatorResponse::new(score))
        }
    }

    fn backend_error() -> OrchestratorError {
        OrchestratorError::Backend {
            backend: "mock".into(),
            message: "502 bad gateway".into(),
        }
    }

    fn services(dir: &tempfile::TempDir, daily_cap: f64, rate: f64, threshold: u32) -> Arc<Services> {
        Arc::new(Services::new(
            CostGovernor::new(
                BudgetConfig {
                    daily_cap,
                    monthly_cap: 1_000.0,
                },
                Arc::new(FlatRateEstimator::new(HashMap::new(), rate)),
            ),
            CircuitRegistry::new(CircuitBreakerConfig {
                failure_threshold: threshold,
                call_timeout_ms: 5_000,
                reset_timeout_ms: 60_000,
            }),
            FallbackQueue::new(dir.path().join("fallback.jsonl")),
            ExecutionSerializer::new(),
        ))
    }

    fn router(rules: Vec<RoutingRule>, default: BackendKind) -> Router {
        Router::new(
            rules,
            Some(default),
            vec!["TFU".into()],
            vec!["partnership".into()],
        )
    }

    fn catch_all(backend: BackendKind) -> RoutingRule {
        RoutingRule {
            name: "everything".into(),
            when: Vec::new(),
            backend,
        }
    }

    struct Fixture {
        serverless: Arc<MockBackend>,
        design: Arc<MockBackend>,
        workflow: Arc<MockBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut design = MockBackend::ok(BackendKind::DesignAutomation, "design");
            design.metered = false;
            Self {
                serverless: Arc::new(MockBackend::ok(BackendKind::Serverless, "serverless")),
                design: Arc::new(design),
                workflow: Arc::new(MockBackend::ok(BackendKind::Workflow, "workflow")),
            }
        }

        fn backends(&self) -> BackendSet {
            BackendSet::new()
                .with(self.serverless.clone())
                .with(self.design.clone())
                .with(self.workflow.clone())
        }

        fn orchestrator(
            &self,
            router: Router,
            validator: Arc<ScriptedValidator>,
            authoritative: Arc<ScriptedValidator>,
            services: Arc<Services>,
        ) -> JobOrchestrator {
            JobOrchestrator::new(router, self.backends(), validator, authoritative, services)
                .with_quality_gate(QualityGate::new(Duration::from_secs(5)))
        }
    }

    fn job(id: &str) -> JobSpec {
        let mut job = JobSpec::new(id, "brief");
        job.qa.threshold = 90.0;
        job
    }

    #[tokio::test]
    async fn happy_path_records_cost_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = Fixture::new();
        fixture.serverless = Arc::new(MockBackend {
            cost: Some(0.3),
            ..MockBackend::ok(BackendKind::Serverless, "serverless")
        });
        let services = services(&dir, 10.0, 0.5, 3);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[], 95.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );

        let result = orch.execute(&job("brief-1")).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.output_ref, "serverless/brief-1-1.pdf");
        assert_eq!(result.metadata.backend, BackendKind::Serverless);
        assert_eq!(result.metadata.route.reason, RouteReason::Default);
        assert!((result.metadata.cost - 0.3).abs() < 1e-9);
        assert_eq!(
            result.metadata.state_history,
            vec![
                JobState::Routed,
                JobState::Admitted,
                JobState::Executing,
                JobState::ValidatedPass
            ]
        );
        let records = services.governor.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, result.metadata.run_id);
        assert_eq!(records[0].estimated_cost, 0.5);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_and_enqueues_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = Fixture::new();
        fixture.serverless = Arc::new(MockBackend::failing(
            BackendKind::Serverless,
            "serverless",
            backend_error,
        ));
        let services = services(&dir, 10.0, 0.5, 3);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );

        for _ in 0..3 {
            let err = orch.execute(&job("brief-b")).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Backend { .. }));
        }
        let err = orch.execute(&job("brief-b")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CircuitOpen));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(fixture.serverless.calls(), 3);

        let pending = services.fallback.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, DEFERRED_PRODUCE);
        assert_eq!(pending[0].service, "serverless");
        assert_eq!(pending[0].operation, "generate");
        assert_eq!(pending[0].payload["jobId"], "brief-b");
        assert_eq!(pending[0].payload["job"]["jobType"], "brief");

        // Failed calls are recorded, the short-circuited one is not.
        let records = services.governor.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| !r.success));
        assert_eq!(services.governor.state().reserved, 0.0);
    }

    #[tokio::test]
    async fn mandatory_workflow_never_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = Fixture::new();
        fixture.workflow = Arc::new(MockBackend::failing(
            BackendKind::Workflow,
            "workflow",
            || OrchestratorError::WorkflowStepMissing {
                workflow: "tfu-aws".into(),
                step: 2,
                provider: "layout".into(),
                reason: "no output".into(),
            },
        ));
        let orch = fixture.orchestrator(
            router(vec![catch_all(BackendKind::Serverless)], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );

        let mut job = job("tfu-1");
        job.style = Some("TFU".into());
        job.workflow = Some(WorkflowSpec {
            name: "tfu-aws".into(),
            providers: vec!["copy".into(), "layout".into()],
        });

        let decision = orch.route(&job).unwrap();
        assert_eq!(decision.backend, BackendKind::Workflow);

        let err = orch.execute(&job).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::WorkflowStepMissing));
        assert_eq!(fixture.workflow.calls(), 1);
        assert_eq!(fixture.serverless.calls(), 0);
        assert_eq!(fixture.design.calls(), 0);
    }

    #[tokio::test]
    async fn premium_guardrail_overrides_serverless_rule() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let orch = fixture.orchestrator(
            router(vec![catch_all(BackendKind::Serverless)], BackendKind::Serverless),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );

        let mut job = JobSpec::new("aws-partner", "partnership");
        job.output.quality = OutputQuality::High;

        let result = orch.execute(&job).await.unwrap();
        assert_eq!(result.metadata.backend, BackendKind::DesignAutomation);
        assert!(matches!(result.metadata.route.reason, RouteReason::Guardrail { .. }));
        assert_eq!(fixture.design.calls(), 1);
        assert_eq!(fixture.serverless.calls(), 0);
    }

    #[tokio::test]
    async fn auto_fix_retry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[82.0, 93.0], 0.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );

        let mut job = job("brief-d");
        job.qa.auto_fix = true;
        let result = orch.execute(&job).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::PassedAfterAutoFix);
        let meta = &result.metadata;
        assert!(meta.auto_fix_applied);
        assert_eq!(meta.first_attempt_score, 82.0);
        assert_eq!(meta.final_score, 93.0);
        assert!(meta.qa.passed);
        assert_eq!(result.output_ref, "design/brief-d-2.pdf");
        assert_eq!(
            meta.state_history.last(),
            Some(&JobState::ValidatedFailRetriedPass)
        );
        assert_eq!(fixture.design.calls(), 2);
    }

    #[tokio::test]
    async fn budget_rejection_happens_before_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let services = services(&dir, 0.4, 0.5, 5);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );

        let err = orch.execute(&job("brief-a")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BudgetExceeded));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(fixture.serverless.calls(), 0);
        assert!(services.governor.records().is_empty());
        assert!(services.fallback.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn world_class_serverless_requires_authoritative_pass() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let authoritative = ScriptedValidator::new(&[90.0, 97.0], 0.0);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[], 99.0),
            Arc::clone(&authoritative),
            services(&dir, 10.0, 0.5, 5),
        );

        let mut job = job("wc-1");
        job.qa.threshold = 50.0;
        job.mode.world_class = true;

        let err = orch.execute(&job).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ValidationFailed { threshold, .. } if threshold == 95.0
        ));

        let result = orch.execute(&job).await.unwrap();
        let report = result.metadata.authoritative_qa.unwrap();
        assert_eq!(report.score, 97.0);
        assert_eq!(result.metadata.threshold, 95.0);
        assert_eq!(*authoritative.thresholds.lock().unwrap(), vec![95.0, 95.0]);
    }

    #[tokio::test]
    async fn world_class_on_design_backend_skips_second_opinion() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let authoritative = ScriptedValidator::new(&[], 0.0);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[], 96.0),
            Arc::clone(&authoritative),
            services(&dir, 10.0, 0.5, 5),
        );
        let mut job = job("wc-2");
        job.mode.world_class = true;

        let result = orch.execute(&job).await.unwrap();
        assert!(result.metadata.authoritative_qa.is_none());
        assert!(authoritative.thresholds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn experiment_picks_best_variant() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[85.0, 40.0, 92.0], 0.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );

        let mut base = job("exp");
        base.qa.threshold = 80.0;
        base.mode.experiment = true;
        base.experiment = Some(ExperimentSpec {
            variants: ["classic", "broken", "bold"]
                .into_iter()
                .map(|name| VariantSpec {
                    name: name.into(),
                    style: None,
                    quality: None,
                    threshold: None,
                    hints: Default::default(),
                })
                .collect(),
        });

        let result = orch.execute(&base).await.unwrap();
        let summary = result.metadata.experiment.as_ref().unwrap();
        assert_eq!(summary.winner, "bold");
        assert_eq!(result.metadata.job_id, "exp-bold");
        assert_eq!(summary.variants.len(), 3);
        assert!(summary.variants[1].error.is_some());
        assert_eq!(summary.variants[0].score, Some(85.0));
        assert_eq!(fixture.design.calls(), 3);
    }

    #[tokio::test]
    async fn experiment_with_no_passing_variant_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[], 10.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );
        let mut base = job("exp-2");
        base.mode.experiment = true;
        base.experiment = Some(ExperimentSpec {
            variants: vec![VariantSpec {
                name: "only".into(),
                style: None,
                quality: None,
                threshold: None,
                hints: Default::default(),
            }],
        });

        let err = orch.execute(&base).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));
    }

    #[tokio::test]
    async fn routing_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let orch = JobOrchestrator::new(
            Router::new(vec![], None, vec![], vec![]),
            fixture.backends(),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.5, 5),
        );
        let err = orch.execute(&job("lost")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RoutingFailed));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn exclusive_backends_never_overlap_but_serverless_does() {
        let dir = tempfile::tempdir().unwrap();
        let exclusive = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let shared = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let backends = BackendSet::new()
            .with(OverlapBackend::new(BackendKind::DesignAutomation, "design", &exclusive))
            .with(OverlapBackend::new(BackendKind::Workflow, "workflow", &exclusive))
            .with(OverlapBackend::new(BackendKind::Serverless, "serverless", &shared));
        let api_rule = RoutingRule {
            name: "api-jobs".into(),
            when: vec![Predicate::new(
                Field::JobType,
                Operator::Eq,
                Some(RuleValue::Text("api".into())),
            )],
            backend: BackendKind::Serverless,
        };
        let orch = JobOrchestrator::new(
            router(vec![api_rule], BackendKind::DesignAutomation),
            backends,
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            services(&dir, 10.0, 0.1, 5),
        );

        let design: Vec<JobSpec> = (0..2).map(|i| job(&format!("design-{i}"))).collect();
        let flow: Vec<JobSpec> = (0..2)
            .map(|i| {
                let mut job = job(&format!("flow-{i}"));
                job.style = Some("TFU".into());
                job
            })
            .collect();
        let api: Vec<JobSpec> = (0..3)
            .map(|i| {
                let mut job = job(&format!("api-{i}"));
                job.job_type = "api".into();
                job
            })
            .collect();

        let (d0, d1, f0, f1, a0, a1, a2) = tokio::join!(
            orch.execute(&design[0]),
            orch.execute(&design[1]),
            orch.execute(&flow[0]),
            orch.execute(&flow[1]),
            orch.execute(&api[0]),
            orch.execute(&api[1]),
            orch.execute(&api[2]),
        );
        for result in [d0, d1, f0, f1, a0, a1, a2] {
            result.unwrap();
        }
        assert_eq!(exclusive.1.load(Ordering::SeqCst), 1);
        assert!(shared.1.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_serializer_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = Fixture::new();
        fixture.design = Arc::new(MockBackend::failing(
            BackendKind::DesignAutomation,
            "design",
            backend_error,
        ));
        let services = services(&dir, 10.0, 0.5, 1);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::DesignAutomation),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );
        orch.execute(&job("design-1")).await.unwrap_err();

        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let holder = services.serializer.run_exclusive(async {
            released.await.ok();
            Ok::<(), OrchestratorError>(())
        });
        let rejected = async {
            let outcome =
                tokio::time::timeout(Duration::from_secs(2), orch.execute(&job("design-2"))).await;
            release.send(()).ok();
            outcome
        };
        let (held, rejected) = tokio::join!(holder, rejected);
        held.unwrap();

        let err = rejected.expect("rejected without waiting for the token").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CircuitOpen));
        assert_eq!(fixture.design.calls(), 1);
        assert_eq!(services.fallback.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn serializer_wait_is_not_call_latency() {
        let dir = tempfile::tempdir().unwrap();
        // Metered so the call leaves a cost record.
        let design = Arc::new(MockBackend::ok(BackendKind::DesignAutomation, "design"));
        let backends = BackendSet::new().with(design);
        let services = services(&dir, 10.0, 0.5, 5);
        let orch = JobOrchestrator::new(
            router(vec![], BackendKind::DesignAutomation),
            backends,
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );

        let holder = services.serializer.run_exclusive(async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<(), OrchestratorError>(())
        });
        let queued = job("queued");
        let (held, result) = tokio::join!(holder, orch.execute(&queued));
        held.unwrap();
        result.unwrap();

        let records = services.governor.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].latency_ms < 100, "latency {}", records[0].latency_ms);
    }

    #[tokio::test]
    async fn caller_run_id_reaches_ledger_fallback_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = Fixture::new();
        fixture.serverless = Arc::new(MockBackend::failing(
            BackendKind::Serverless,
            "serverless",
            backend_error,
        ));
        let services = services(&dir, 10.0, 0.5, 1);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );
        let job = job("brief-r");

        orch.execute_run(&job, "run-1").await.unwrap_err();
        assert_eq!(services.governor.records()[0].run_id, "run-1");

        let err = orch.execute_run(&job, "run-2").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CircuitOpen));
        let pending = services.fallback.pending().await.unwrap();
        assert_eq!(pending[0].payload["runId"], "run-2");

        let report = RunReport::failure(&job.job_id, "run-2", &err);
        assert_eq!(report.file_name(), "brief-r-run-2.json");
    }

    #[tokio::test]
    async fn budget_rejected_correction_keeps_first_score() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Fixture::new();
        let services = services(&dir, 0.9, 0.5, 5);
        let orch = fixture.orchestrator(
            router(vec![], BackendKind::Serverless),
            ScriptedValidator::new(&[82.0], 100.0),
            ScriptedValidator::new(&[], 100.0),
            Arc::clone(&services),
        );
        let mut job = job("brief-c");
        job.qa.auto_fix = true;

        let err = orch.execute(&job).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BudgetExceeded));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.attempt_scores(), vec![82.0]);
        assert!(err.to_string().contains("82"));
        assert_eq!(fixture.serverless.calls(), 1);
        assert_eq!(services.governor.records().len(), 1);
    }

    #[tokio::test]
    async fn status_reports_budget_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(&dir, 10.0, 0.5, 5);
        services.circuits.breaker("serverless");
        let status = services.status().await.unwrap();
        assert_eq!(status.budget.daily_cap, 10.0);
        assert_eq!(status.fallback_pending, 0);
        assert_eq!(status.circuits.len(), 1);
    }
}
