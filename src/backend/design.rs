use std::time::Duration;

use async_trait::async_trait;

use super::{Artifact, Backend, ProduceRequest};
use crate::config::DesignConfig;
use crate::error::Result;
use crate::process::run_json;
use crate::router::BackendKind;

/// Drives the interactive design tool through a bridge command.
///
/// The tool is a single instance; callers must hold the execution
/// serializer while `produce` runs.
#[derive(Debug, Clone)]
pub struct DesignBackend {
    service: String,
    command: Vec<String>,
    supports_correction: bool,
    metered: bool,
    timeout: Duration,
}

impl DesignBackend {
    pub fn new(config: &DesignConfig) -> Self {
        Self {
            service: config.service.clone(),
            command: config.command.clone(),
            supports_correction: config.supports_correction,
            metered: config.metered,
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

#[async_trait]
impl Backend for DesignBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DesignAutomation
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn supports_correction(&self) -> bool {
        self.supports_correction
    }

    fn metered(&self) -> bool {
        self.metered
    }

    async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact> {
        run_json(&self.command, request, self.timeout, &self.service).await
    }
}
