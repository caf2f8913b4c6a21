//! Mutual exclusion for the single-instance design tool.
//!
//! Built on `tokio::sync::Mutex`, which grants the lock in FIFO order. The
//! guard is scoped to [`ExecutionSerializer::run_exclusive`], so it is
//! released on success, error and cancellation alike. Acquisition is not
//! reentrant: a task already holding the token gets `SerializerReentry`
//! instead of deadlocking. Tasks spawned from inside the closure do not
//! inherit the marker and must not acquire the serializer either.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

tokio::task_local! {
    static HOLDING: ();
}

#[derive(Debug, Default)]
pub struct ExecutionSerializer {
    gate: Mutex<()>,
    waiting: AtomicUsize,
}

struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` while holding the exclusive token.
    pub async fn run_exclusive<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if HOLDING.try_with(|_| ()).is_ok() {
            return Err(OrchestratorError::SerializerReentry);
        }

        let guard = {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _waiting = Waiting(&self.waiting);
            debug!(queued = self.waiting.load(Ordering::SeqCst), "waiting for exclusive backend");
            self.gate.lock().await
        };

        let result = HOLDING.scope((), work).await;
        drop(guard);
        result
    }

    /// Number of callers queued for the token.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}
