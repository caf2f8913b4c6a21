//! Orchestrator configuration loaded from `docpilot.toml`.
//!
//! Every section has sensible defaults, so an absent file or a partial file
//! both produce a usable [`DocpilotConfig`]. The environment variable
//! `DOCPILOT_SERVERLESS_API_KEY` takes precedence over the file for the
//! serverless API key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::router::{BackendKind, RoutingRule};

pub const DEFAULT_CONFIG_FILE: &str = "docpilot.toml";
pub const API_KEY_ENV: &str = "DOCPILOT_SERVERLESS_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DocpilotConfig {
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quality: QualityConfig,
    pub router: RouterConfig,
    pub costs: CostConfig,
    pub fallback: FallbackConfig,
    pub ledger: LedgerConfig,
    pub backends: BackendsConfig,
    pub validator: ValidatorConfig,
    pub experiment: ExperimentConfig,
    pub reports: ReportsConfig,
}

/// Spending caps, in the same currency unit the cost estimates use.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_cap: f64,
    pub monthly_cap: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cap: 10.0,
            monthly_cap: 200.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Per-call timeout; a call running longer counts as a failure.
    pub call_timeout_ms: u64,
    /// How long an open breaker rejects calls before allowing one probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout_ms: 300_000,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Timeout applied to every validator call.
    pub validate_timeout_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            validate_timeout_ms: 120_000,
        }
    }
}

impl QualityConfig {
    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Styles or tags that force the multi-provider workflow backend.
    pub mandatory_workflow_styles: Vec<String>,
    /// Job types the quality guardrail treats as premium.
    pub premium_job_types: Vec<String>,
    /// Backend used when no rule matches. `None` makes that a routing failure.
    pub default_backend: Option<BackendKind>,
    /// Ordered rules; the first match wins.
    pub rules: Vec<RoutingRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mandatory_workflow_styles: vec!["TFU".to_string()],
            premium_job_types: vec!["partnership".to_string(), "premium".to_string()],
            default_backend: Some(BackendKind::DesignAutomation),
            rules: Vec::new(),
        }
    }
}

/// Flat cost table: keys are `service.operation` or `service`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub default: f64,
    pub rates: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub queue_path: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from(".docpilot/fallback-queue.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Cost ledger file. `None` keeps records in memory only.
    pub path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from(".docpilot/cost-ledger.jsonl")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub serverless: ServerlessConfig,
    pub design: DesignConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerlessConfig {
    pub service: String,
    pub endpoint: String,
    pub api_key: String,
    pub supports_correction: bool,
    pub request_timeout_ms: u64,
}

impl Default for ServerlessConfig {
    fn default() -> Self {
        Self {
            service: "serverless-api".to_string(),
            endpoint: "http://127.0.0.1:8787".to_string(),
            api_key: String::new(),
            supports_correction: false,
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DesignConfig {
    pub service: String,
    /// Bridge command receiving a JSON request on stdin.
    pub command: Vec<String>,
    pub supports_correction: bool,
    /// Whether calls are charged against the budget.
    pub metered: bool,
    pub request_timeout_ms: u64,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            service: "design-automation".to_string(),
            command: vec!["python3".to_string(), "bridge/design_bridge.py".to_string()],
            supports_correction: true,
            metered: false,
            request_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub service: String,
    pub supports_correction: bool,
    /// Provider name to command.
    pub providers: HashMap<String, Vec<String>>,
    pub step_timeout_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            service: "workflow".to_string(),
            supports_correction: false,
            providers: HashMap::new(),
            step_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Validator used for every job.
    pub command: Vec<String>,
    /// Stricter validator backed by the design tool, used to re-check
    /// world-class jobs produced by the serverless backend.
    pub authoritative_command: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "validate_document.py".to_string()],
            authoritative_command: vec![
                "python3".to_string(),
                "validate_world_class.py".to_string(),
            ],
        }
    }
}

/// Weights for picking an experiment winner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub quality_weight: f64,
    pub first_pass_weight: f64,
    pub cost_weight: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            quality_weight: 0.7,
            first_pass_weight: 0.3,
            cost_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    pub dir: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reports"),
        }
    }
}

impl DocpilotConfig {
    /// Loads configuration from `path`, or `docpilot.toml` in the current
    /// directory. Falls back to defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.is_empty()
        {
            config.backends.serverless.api_key = key;
        }

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: DocpilotConfig = toml::from_str(contents)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.budget.daily_cap < 0.0 || self.budget.monthly_cap < 0.0 {
            anyhow::bail!("budget caps must not be negative");
        }
        Ok(())
    }
}
