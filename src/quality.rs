//! Threshold-and-retry policy around artifact validation.
//!
//! The gate never scores anything itself. It resolves the threshold in force,
//! asks the validator for a verdict, and allows at most one corrective
//! regeneration per job.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::backend::Artifact;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::JobSpec;
use crate::validator::{Validator, ValidatorResponse};

/// Minimum threshold for world-class jobs; configuration cannot lower it.
pub const WORLD_CLASS_FLOOR: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Rating {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 80.0 {
            Rating::Excellent
        } else if percentage >= 60.0 {
            Rating::Good
        } else if percentage >= 40.0 {
            Rating::Fair
        } else {
            Rating::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Excellent => "EXCELLENT",
            Rating::Good => "GOOD",
            Rating::Fair => "FAIR",
            Rating::Poor => "POOR",
        }
    }
}

/// Verdict for one artifact against one threshold. Built fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaReport {
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub rating: String,
    pub passed: bool,
    pub threshold: f64,
}

impl QaReport {
    /// `passed` is derived here from `score >= threshold`; whatever the
    /// validator believes about passing is ignored.
    pub fn from_response(response: &ValidatorResponse, threshold: f64) -> Self {
        let percentage = response.percentage.unwrap_or_else(|| {
            if response.max_score > 0.0 {
                response.score / response.max_score * 100.0
            } else {
                0.0
            }
        });
        let rating = response
            .rating
            .clone()
            .unwrap_or_else(|| Rating::from_percentage(percentage).as_str().to_string());
        Self {
            score: response.score,
            max_score: response.max_score,
            percentage,
            rating,
            passed: response.score >= threshold,
            threshold,
        }
    }
}

/// Which production attempt a backend is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub number: u8,
    pub corrective: bool,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            number: 1,
            corrective: false,
        }
    }

    pub fn corrective() -> Self {
        Self {
            number: 2,
            corrective: true,
        }
    }

    /// Operation name used for budgeting and cost records.
    pub fn operation(&self) -> &'static str {
        if self.corrective { "correct" } else { "generate" }
    }
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub artifact: Artifact,
    pub report: QaReport,
    pub auto_fix_applied: bool,
    pub first_attempt_score: f64,
    pub final_score: f64,
    pub attempt_scores: Vec<f64>,
}

#[derive(Debug)]
pub struct QualityGate {
    validate_timeout: Duration,
    /// Job ids that already used their correction. Lives as long as the
    /// gate, which is one orchestrator per process; one entry per corrected
    /// job, never pruned.
    corrected: Mutex<HashSet<String>>,
}

impl QualityGate {
    pub fn new(validate_timeout: Duration) -> Self {
        Self {
            validate_timeout,
            corrected: Mutex::new(HashSet::new()),
        }
    }

    pub fn effective_threshold(job: &JobSpec) -> f64 {
        if job.mode.world_class {
            job.qa.threshold.max(WORLD_CLASS_FLOOR)
        } else {
            job.qa.threshold
        }
    }

    /// Produces and validates an artifact, with at most one corrective retry.
    ///
    /// The retry happens only when the job asks for auto-fix, the backend
    /// supports correction, and this job has not been corrected before by
    /// this gate. A second failure reports both scores; an error while
    /// producing or validating the correction is wrapped in
    /// `CorrectionFailed` so the first score is still reported.
    pub async fn enforce<P, Fut>(
        &self,
        job: &JobSpec,
        supports_correction: bool,
        validator: &dyn Validator,
        mut produce: P,
    ) -> Result<GateOutcome>
    where
        P: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<Artifact>>,
    {
        let threshold = Self::effective_threshold(job);

        let artifact = produce(Attempt::first()).await?;
        let report = self.validate(validator, &artifact.output_ref, threshold).await?;
        let first_score = report.score;
        info!(job_id = %job.job_id, score = report.score, threshold, passed = report.passed, "first validation");

        if report.passed {
            return Ok(GateOutcome {
                artifact,
                report,
                auto_fix_applied: false,
                first_attempt_score: first_score,
                final_score: first_score,
                attempt_scores: vec![first_score],
            });
        }

        if !(job.qa.auto_fix && supports_correction) {
            warn!(
                job_id = %job.job_id,
                auto_fix = job.qa.auto_fix,
                supports_correction,
                "validation failed, no correction permitted"
            );
            return Err(OrchestratorError::ValidationFailed {
                threshold,
                scores: vec![first_score],
            });
        }
        if !self.claim_correction(&job.job_id) {
            warn!(job_id = %job.job_id, "correction already spent for this job");
            return Err(OrchestratorError::ValidationFailed {
                threshold,
                scores: vec![first_score],
            });
        }

        info!(job_id = %job.job_id, "requesting corrective regeneration");
        let corrected = match produce(Attempt::corrective()).await {
            Ok(artifact) => self
                .validate(validator, &artifact.output_ref, threshold)
                .await
                .map(|report| (artifact, report)),
            Err(e) => Err(e),
        };
        let (artifact, report) = corrected.map_err(|e| {
            warn!(job_id = %job.job_id, first_score, error = %e, "corrective attempt failed");
            OrchestratorError::CorrectionFailed {
                threshold,
                first_attempt_score: first_score,
                source: Box::new(e),
            }
        })?;
        let final_score = report.score;
        info!(job_id = %job.job_id, score = final_score, threshold, passed = report.passed, "corrective validation");

        if !report.passed {
            return Err(OrchestratorError::ValidationFailed {
                threshold,
                scores: vec![first_score, final_score],
            });
        }
        Ok(GateOutcome {
            artifact,
            report,
            auto_fix_applied: true,
            first_attempt_score: first_score,
            final_score,
            attempt_scores: vec![first_score, final_score],
        })
    }

    /// Independent re-check of an accepted artifact. Never retries.
    pub async fn confirm(
        &self,
        validator: &dyn Validator,
        output_ref: &str,
        threshold: f64,
    ) -> Result<QaReport> {
        let report = self.validate(validator, output_ref, threshold).await?;
        if !report.passed {
            warn!(output_ref, score = report.score, threshold, "authoritative validation rejected artifact");
            return Err(OrchestratorError::ValidationFailed {
                threshold,
                scores: vec![report.score],
            });
        }
        Ok(report)
    }

    async fn validate(
        &self,
        validator: &dyn Validator,
        output_ref: &str,
        threshold: f64,
    ) -> Result<QaReport> {
        let response = timeout(self.validate_timeout, validator.validate(output_ref, threshold))
            .await
            .map_err(|_| OrchestratorError::Timeout {
                operation: "validation".to_string(),
                after: self.validate_timeout,
            })??;
        Ok(QaReport::from_response(&response, threshold))
    }

    fn claim_correction(&self, job_id: &str) -> bool {
        self.corrected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string())
    }
}
