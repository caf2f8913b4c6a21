use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{Artifact, Backend, ProduceRequest};
use crate::config::ServerlessConfig;
use crate::error::{OrchestratorError, Result};
use crate::router::BackendKind;

const GENERATE_PATH: &str = "/v1/documents";

/// HTTP document-generation API. Cheap and parallel, but pay-per-call.
pub struct ServerlessBackend {
    service: String,
    endpoint: String,
    api_key: String,
    supports_correction: bool,
    client: Client,
}

impl ServerlessBackend {
    pub fn new(config: &ServerlessConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            service: config.service.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            supports_correction: config.supports_correction,
            client,
        })
    }
}

#[async_trait]
impl Backend for ServerlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serverless
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn supports_correction(&self) -> bool {
        self.supports_correction
    }

    async fn produce(&self, request: &ProduceRequest<'_>) -> Result<Artifact> {
        let url = format!("{}{GENERATE_PATH}", self.endpoint);
        debug!(url = %url, run_id = request.run_id, attempt = request.attempt.number, "posting generation request");

        let mut builder = self.client.post(&url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(OrchestratorError::Backend {
                backend: self.service.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), message),
            });
        }

        Ok(response.json::<Artifact>().await?)
    }
}
