//! Execution backends that turn a job into an artifact.

pub mod design;
pub mod serverless;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DocpilotConfig;
use crate::error::{OrchestratorError, Result};
use crate::quality::Attempt;
use crate::router::BackendKind;
use crate::state_machine::JobSpec;

pub use design::DesignBackend;
pub use serverless::ServerlessBackend;
pub use workflow::{CommandProvider, StepOutput, StepRequest, WorkflowBackend, WorkflowProvider};

/// What a backend hands back: a reference to the produced document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub output_ref: String,
    /// Actual cost reported by the backend, if it knows it.
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub steps: Vec<StepTrace>,
}

impl Artifact {
    pub fn new(output_ref: impl Into<String>) -> Self {
        Self {
            output_ref: output_ref.into(),
            cost: None,
            steps: Vec::new(),
        }
    }
}

/// One executed workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    pub step: usize,
    pub provider: String,
    pub output_ref: Option<String>,
    pub duration_ms: u64,
}

/// Payload sent to a backend for one production attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest<'a> {
    pub job: &'a JobSpec,
    pub run_id: &'a str,
    pub attempt: Attempt,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Service name used for budgeting and circuit breaking.
    fn service(&self) -> &str;

    fn supports_correction(&self) -> bool;

    /// Whether calls are charged against the budget.
    fn metered(&self) -> bool {
        true
    }

    async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact>;
}

/// The backends available to the orchestrator, keyed by kind.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.backends.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("BackendSet").field("kinds", &kinds).finish()
    }
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn from_config(config: &DocpilotConfig) -> Result<Self> {
        let backends = &config.backends;
        let providers = backends
            .workflow
            .providers
            .iter()
            .map(|(name, command)| {
                let provider: Arc<dyn WorkflowProvider> = Arc::new(CommandProvider::new(
                    name.clone(),
                    command.clone(),
                    Duration::from_millis(backends.workflow.step_timeout_ms),
                ));
                (name.clone(), provider)
            })
            .collect();

        Ok(Self::new()
            .with(Arc::new(ServerlessBackend::new(&backends.serverless)?))
            .with(Arc::new(DesignBackend::new(&backends.design)))
            .with(Arc::new(WorkflowBackend::new(&backends.workflow, providers))))
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| OrchestratorError::Config(format!("no {kind} backend configured")))
    }
}
