//! JSON-over-stdio subprocess calls.
//!
//! The request is written to the child's stdin as one JSON document and the
//! child must print exactly one JSON document to stdout. Anything else is a
//! contract violation, never something to pattern-match around.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

pub async fn run_json<Req, Resp>(
    command: &[String],
    request: &Req,
    limit: Duration,
    label: &str,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let (program, args) = command
        .split_first()
        .ok_or_else(|| OrchestratorError::Config(format!("{label}: command is empty")))?;
    let body = serde_json::to_vec(request)?;

    debug!(label, program = %program, "spawning subprocess");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| OrchestratorError::Config(format!("{label}: stdin unavailable")))?;

    let run = async move {
        if let Err(e) = stdin.write_all(&body).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e);
        }
        drop(stdin);
        child.wait_with_output().await
    };

    let output = timeout(limit, run)
        .await
        .map_err(|_| OrchestratorError::Timeout {
            operation: label.to_string(),
            after: limit,
        })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::Backend {
            backend: label.to_string(),
            message: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }

    serde_json::from_slice(output.stdout.trim_ascii()).map_err(|e| OrchestratorError::Backend {
        backend: label.to_string(),
        message: format!("invalid JSON response: {e}"),
    })
}
