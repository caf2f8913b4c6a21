//! Artifact validation collaborator.
//!
//! The scoring itself happens elsewhere; this module defines the typed
//! request/response contract and a subprocess-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::run_json;

fn default_max_score() -> f64 {
    100.0
}

/// What a validator reports for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorResponse {
    pub score: f64,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub rating: Option<String>,
}

impl ValidatorResponse {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            max_score: default_max_score(),
            percentage: None,
            rating: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ValidationRequest<'a> {
    artifact: &'a str,
    threshold: f64,
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, artifact: &str, threshold: f64) -> Result<ValidatorResponse>;
}

/// Runs a validator command speaking JSON over stdio.
#[derive(Debug, Clone)]
pub struct ProcessValidator {
    command: Vec<String>,
    timeout: Duration,
    label: String,
}

impl ProcessValidator {
    pub fn new(label: impl Into<String>, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            label: label.into(),
        }
    }
}

#[async_trait]
impl Validator for ProcessValidator {
    async fn validate(&self, artifact: &str, threshold: f64) -> Result<ValidatorResponse> {
        let request = ValidationRequest {
            artifact,
            threshold,
        };
        run_json(&self.command, &request, self.timeout, &self.label).await
    }
}
