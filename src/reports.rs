//! Run reports written after every `run`, one JSON file per execution.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::state_machine::ExecutionResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub exit_code: i32,
    /// Validator scores reached before the failure, in attempt order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_scores: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub job_id: String,
    pub run_id: String,
    pub success: bool,
    pub written_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
}

impl RunReport {
    pub fn success(result: &ExecutionResult) -> Self {
        Self {
            job_id: result.metadata.job_id.clone(),
            run_id: result.metadata.run_id.clone(),
            success: true,
            written_at: Utc::now(),
            result: Some(result.clone()),
            failure: None,
        }
    }

    /// `run_id` is the id the run was executed under, so the report joins
    /// with its cost records and fallback tasks.
    pub fn failure(job_id: &str, run_id: &str, error: &OrchestratorError) -> Self {
        Self {
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            success: false,
            written_at: Utc::now(),
            result: None,
            failure: Some(FailureSummary {
                kind: error.kind(),
                message: error.to_string(),
                exit_code: error.exit_code(),
                attempt_scores: error.attempt_scores(),
            }),
        }
    }

    pub fn file_name(&self) -> String {
        let safe: String = self
            .job_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{safe}-{}.json", self.run_id)
    }

    /// Writes the report into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_is_written_with_kind_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let error = OrchestratorError::ValidationFailed {
            threshold: 90.0,
            scores: vec![82.0, 85.0],
        };
        let report = RunReport::failure("aws/brief 1", "run-7", &error);
        let path = report.write(&dir.path().join("reports")).unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "aws_brief_1-run-7.json");

        let saved: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(!saved.success);
        let failure = saved.failure.unwrap();
        assert_eq!(failure.kind, Some(ErrorKind::ValidationFailed));
        assert_eq!(failure.exit_code, 4);
        assert!(failure.message.contains("82"));
        assert_eq!(failure.attempt_scores, vec![82.0, 85.0]);
        assert!(saved.result.is_none());
    }
}
