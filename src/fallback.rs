//! Durable holding area for calls rejected by an open circuit.
//!
//! Tasks are appended as JSON lines and flushed before `enqueue` returns.
//! Draining and replaying the queue belongs to an external sweeper; this
//! module only produces to it (plus a read-only listing for diagnostics).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;

/// Everything a sweeper needs to replay the call without re-deriving context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackTask {
    #[serde(rename = "type")]
    pub task_type: String,
    pub service: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl FallbackTask {
    pub fn new(
        task_type: impl Into<String>,
        service: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            service: service.into(),
            operation: operation.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct FallbackQueue {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FallbackQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `task` and syncs it to disk.
    pub async fn enqueue(&self, task: &FallbackTask) -> Result<()> {
        let mut line = serde_json::to_vec(task)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        info!(
            service = %task.service,
            operation = %task.operation,
            task_type = %task.task_type,
            "task deferred to fallback queue"
        );
        Ok(())
    }

    /// Tasks currently on disk, oldest first.
    pub async fn pending(&self) -> Result<Vec<FallbackTask>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(line = n + 1, error = %e, "skipping malformed fallback task"),
            }
        }
        Ok(tasks)
    }
}
