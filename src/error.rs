//! Error taxonomy for the orchestrator.
//!
//! [`OrchestratorError`] carries the five domain failures (budget, circuit,
//! validation, routing, workflow) with structured payloads next to the
//! infrastructure errors bubbled up from I/O, HTTP and parsing.
//! [`ErrorKind`] is the closed classification callers match on.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which spending window rejected an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetWindow::Daily => write!(f, "daily"),
            BudgetWindow::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(
        "{window} budget exceeded for {service}/{operation}: spend {spend:.2} + estimate {estimate:.2} > cap {cap:.2}"
    )]
    BudgetExceeded {
        service: String,
        operation: String,
        window: BudgetWindow,
        spend: f64,
        estimate: f64,
        cap: f64,
    },

    #[error("circuit open for {service}, next attempt allowed in {}ms", .retry_in.as_millis())]
    CircuitOpen { service: String, retry_in: Duration },

    #[error("validation failed (threshold {threshold}): attempt scores {scores:?}")]
    ValidationFailed { threshold: f64, scores: Vec<f64> },

    /// The first attempt was scored, then the corrective attempt could not
    /// be produced or validated. Classified by its cause.
    #[error(
        "corrective attempt failed after first attempt scored {first_attempt_score} (threshold {threshold}): {source}"
    )]
    CorrectionFailed {
        threshold: f64,
        first_attempt_score: f64,
        source: Box<OrchestratorError>,
    },

    #[error("routing failed for job {job_id}: {reason}")]
    RoutingFailed { job_id: String, reason: String },

    #[error("workflow '{workflow}' step {step} ({provider}) produced no usable output: {reason}")]
    WorkflowStepMissing {
        workflow: String,
        step: usize,
        provider: String,
        reason: String,
    },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("backend {backend} failed: {message}")]
    Backend { backend: String, message: String },

    #[error("validator error: {0}")]
    Validator(String),

    #[error("execution serializer is already held by this task")]
    SerializerReentry,

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Closed classification of the domain failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    BudgetExceeded,
    CircuitOpen,
    ValidationFailed,
    RoutingFailed,
    WorkflowStepMissing,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::BudgetExceeded => write!(f, "BudgetExceeded"),
            ErrorKind::CircuitOpen => write!(f, "CircuitOpen"),
            ErrorKind::ValidationFailed => write!(f, "ValidationFailed"),
            ErrorKind::RoutingFailed => write!(f, "RoutingFailed"),
            ErrorKind::WorkflowStepMissing => write!(f, "WorkflowStepMissing"),
        }
    }
}

impl OrchestratorError {
    /// Domain classification, `None` for infrastructure errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestratorError::BudgetExceeded { .. } => Some(ErrorKind::BudgetExceeded),
            OrchestratorError::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            OrchestratorError::ValidationFailed { .. } => Some(ErrorKind::ValidationFailed),
            OrchestratorError::RoutingFailed { .. } => Some(ErrorKind::RoutingFailed),
            OrchestratorError::WorkflowStepMissing { .. } => Some(ErrorKind::WorkflowStepMissing),
            OrchestratorError::CorrectionFailed { source, .. } => source.kind(),
            _ => None,
        }
    }

    /// Whether a circuit breaker should count this error against the service.
    ///
    /// Budget and circuit rejections happen before the service is touched.
    pub fn counts_as_service_failure(&self) -> bool {
        if let OrchestratorError::CorrectionFailed { source, .. } = self {
            return source.counts_as_service_failure();
        }
        !matches!(
            self,
            OrchestratorError::BudgetExceeded { .. }
                | OrchestratorError::CircuitOpen { .. }
                | OrchestratorError::SerializerReentry
        )
    }

    /// Validator scores known at the point of failure, in attempt order.
    pub fn attempt_scores(&self) -> Vec<f64> {
        match self {
            OrchestratorError::ValidationFailed { scores, .. } => scores.clone(),
            OrchestratorError::CorrectionFailed {
                first_attempt_score,
                ..
            } => vec![*first_attempt_score],
            _ => Vec::new(),
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            Some(ErrorKind::BudgetExceeded) => 2,
            Some(ErrorKind::CircuitOpen) => 3,
            Some(ErrorKind::ValidationFailed) => 4,
            Some(ErrorKind::RoutingFailed) => 5,
            Some(ErrorKind::WorkflowStepMissing) => 6,
            None => 1,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
