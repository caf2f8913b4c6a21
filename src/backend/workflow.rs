//! Multi-provider workflow execution.
//!
//! A workflow runs its providers in declared order, each step receiving the
//! previous step's output. Any step that is unknown, fails, or yields no
//! output stops the workflow with `WorkflowStepMissing`. There is no
//! substitute provider and no fallback to another backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Artifact, Backend, ProduceRequest, StepTrace};
use crate::config::WorkflowConfig;
use crate::error::{OrchestratorError, Result};
use crate::process::run_json;
use crate::quality::Attempt;
use crate::router::BackendKind;
use crate::state_machine::JobSpec;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest<'a> {
    pub workflow: &'a str,
    pub step: usize,
    pub job: &'a JobSpec,
    pub run_id: &'a str,
    pub attempt: Attempt,
    /// Output of the preceding step, `None` for the first.
    pub previous: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    async fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput>;
}

/// Provider backed by an external command speaking JSON over stdio.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(name: impl Into<String>, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command,
            timeout,
        }
    }
}

#[async_trait]
impl WorkflowProvider for CommandProvider {
    async fn run(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        run_json(&self.command, request, self.timeout, &self.name).await
    }
}

pub struct WorkflowBackend {
    service: String,
    supports_correction: bool,
    providers: HashMap<String, Arc<dyn WorkflowProvider>>,
}

impl WorkflowBackend {
    pub fn new(
        config: &WorkflowConfig,
        providers: HashMap<String, Arc<dyn WorkflowProvider>>,
    ) -> Self {
        Self {
            service: config.service.clone(),
            supports_correction: config.supports_correction,
            providers,
        }
    }
}

fn missing(workflow: &str, step: usize, provider: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::WorkflowStepMissing {
        workflow: workflow.to_string(),
        step,
        provider: provider.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl Backend for WorkflowBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Workflow
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn supports_correction(&self) -> bool {
        self.supports_correction
    }

    async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact> {
        let job = request.job;
        let Some(spec) = &job.workflow else {
            return Err(missing("<none>", 0, "", "job declares no workflow"));
        };
        if spec.providers.is_empty() {
            return Err(missing(&spec.name, 0, "", "workflow declares no providers"));
        }

        let mut steps = Vec::with_capacity(spec.providers.len());
        let mut previous: Option<String> = None;
        let mut cost: Option<f64> = None;

        for (index, name) in spec.providers.iter().enumerate() {
            let step = index + 1;
            let provider = self
                .providers
                .get(name)
                .ok_or_else(|| missing(&spec.name, step, name, "provider not configured"))?;

            let started = Instant::now();
            let output = provider
                .run(&StepRequest {
                    workflow: &spec.name,
                    step,
                    job,
                    run_id: request.run_id,
                    attempt: request.attempt,
                    previous: previous.as_deref(),
                })
                .await
                .map_err(|e| {
                    warn!(workflow = %spec.name, step, provider = %name, error = %e, "workflow step failed");
                    missing(&spec.name, step, name, e.to_string())
                })?;
            let duration_ms = started.elapsed().as_millis() as u64;

            let output_ref = output
                .output_ref
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| missing(&spec.name, step, name, "step returned no output"))?;
            if let Some(step_cost) = output.cost {
                *cost.get_or_insert(0.0) += step_cost;
            }

            info!(workflow = %spec.name, step, provider = %name, duration_ms, "workflow step done");
            steps.push(StepTrace {
                step,
                provider: name.clone(),
                output_ref: Some(output_ref.clone()),
                duration_ms,
            });
            previous = Some(output_ref);
        }

        let output_ref = previous.ok_or_else(|| missing(&spec.name, 0, "", "workflow produced nothing"))?;
        Ok(Artifact {
            output_ref,
            cost,
            steps,
        })
    }
}
