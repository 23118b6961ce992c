//! Cleanup of transient per-job storage.
//!
//! Runs on every job exit path. It is idempotent and never returns an
//! error: failures are logged and swallowed so that cleanup can never block
//! completion reporting.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use murmur_core::types::JobId;

use crate::storage::TransientStorage;

#[derive(Debug, Clone)]
pub struct CleanupManager {
    storage: Arc<TransientStorage>,
    /// Cleanup calls so far, shared between clones.
    runs: Arc<AtomicU64>,
}

impl CleanupManager {
    pub fn new(storage: Arc<TransientStorage>) -> Self {
        Self {
            storage,
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of times [`cleanup`](Self::cleanup) has run, found or not.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Remove the job's transient directory.
    ///
    /// Returns `true` if something was removed, `false` if it was already
    /// gone or removal failed.
    pub async fn cleanup(&self, id: JobId) -> bool {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let dir = self.storage.job_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(job_id = %id, path = %dir.display(), "Transient storage removed");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(
                    job_id = %id,
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove transient storage",
                );
                false
            }
        }
    }
}
