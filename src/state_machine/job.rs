use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;
use crate::backend::StepTrace;
use crate::error::{OrchestratorError, Result};
use crate::quality::QaReport;
use crate::router::{BackendKind, RouteDecision};

/// Output quality requested by the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputQuality {
    Draft,
    #[default]
    Standard,
    High,
}

impl OutputQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputQuality::Draft => "draft",
            OutputQuality::Standard => "standard",
            OutputQuality::High => "high",
        }
    }
}

/// Execution-mode flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeFlags {
    pub world_class: bool,
    pub experiment: bool,
    /// Free-form session mode (e.g. `interactive`, `batch`), visible to router rules.
    pub session: Option<String>,
}

/// Per-job quality configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QaConfig {
    pub threshold: f64,
    pub auto_fix: bool,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            threshold: 80.0,
            auto_fix: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSpec {
    pub path: Option<String>,
    pub format: String,
    pub quality: OutputQuality,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            path: None,
            format: "pdf".to_string(),
            quality: OutputQuality::default(),
        }
    }
}

/// Ordered multi-provider execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub providers: Vec<String>,
}

/// One experiment variant: overrides applied on top of the base job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantSpec {
    pub name: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub quality: Option<OutputQuality>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentSpec {
    pub variants: Vec<VariantSpec>,
}

/// A job as submitted by the caller. Never mutated after submission;
/// variants are derived as new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub job_id: String,
    pub job_type: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Routing hints, addressable from rules as `hint:<key>`.
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: ModeFlags,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub workflow: Option<WorkflowSpec>,
    #[serde(default)]
    pub experiment: Option<ExperimentSpec>,
    /// Content handed to the backend untouched.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            style: None,
            tags: Vec::new(),
            hints: BTreeMap::new(),
            mode: ModeFlags::default(),
            qa: QaConfig::default(),
            output: OutputSpec::default(),
            workflow: None,
            experiment: None,
            data: serde_json::Value::Null,
        }
    }

    /// Reads a job file, JSON or TOML depending on the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let job: JobSpec = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(OrchestratorError::Config("jobId must not be empty".into()));
        }
        if self.job_type.trim().is_empty() {
            return Err(OrchestratorError::Config("jobType must not be empty".into()));
        }
        if !(0.0..=100.0).contains(&self.qa.threshold) {
            return Err(OrchestratorError::Config(format!(
                "qa.threshold must be within 0..=100, got {}",
                self.qa.threshold
            )));
        }
        Ok(())
    }

    /// Derives the job for one experiment variant.
    pub fn variant(&self, variant: &VariantSpec) -> JobSpec {
        let mut job = self.clone();
        job.job_id = format!("{}-{}", self.job_id, variant.name);
        job.mode.experiment = false;
        job.experiment = None;
        if let Some(style) = &variant.style {
            job.style = Some(style.clone());
        }
        if let Some(quality) = variant.quality {
            job.output.quality = quality;
        }
        if let Some(threshold) = variant.threshold {
            job.qa.threshold = threshold;
        }
        for (key, value) in &variant.hints {
            job.hints.insert(key.clone(), value.clone());
        }
        job.hints.insert("variant".to_string(), variant.name.clone());
        job
    }

    pub fn runs_experiment(&self) -> bool {
        self.mode.experiment
            && self
                .experiment
                .as_ref()
                .is_some_and(|e| !e.variants.is_empty())
    }
}

/// State owned by the orchestrator for a single execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub run_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub backend: BackendKind,
    pub route: RouteDecision,
    pub threshold: f64,
}

impl RunContext {
    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn new(job: &JobSpec, route: RouteDecision, threshold: f64, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            job_id: job.job_id.clone(),
            started_at: Utc::now(),
            backend: route.backend,
            route,
            threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    PassedAfterAutoFix,
}

/// Outcome of one experiment variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOutcome {
    pub name: String,
    pub job_id: String,
    pub run_id: Option<String>,
    pub score: Option<f64>,
    pub composite: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub winner: String,
    pub variants: Vec<VariantOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub run_id: String,
    pub job_id: String,
    pub backend: BackendKind,
    pub route: RouteDecision,
    pub threshold: f64,
    pub cost: f64,
    pub qa: QaReport,
    pub auto_fix_applied: bool,
    pub first_attempt_score: f64,
    pub final_score: f64,
    pub attempt_scores: Vec<f64>,
    /// Second opinion required for world-class jobs on the serverless backend.
    pub authoritative_qa: Option<QaReport>,
    pub workflow_trace: Vec<StepTrace>,
    pub state_history: Vec<JobState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub experiment: Option<ExperimentSummary>,
}

/// Terminal value returned for a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output_ref: String,
    pub metadata: ResultMetadata,
}
