//! Transient per-job storage.
//!
//! Each job owns one directory under the transient root:
//!
//! ```text
//! <root>/<job_id>/input.<ext>          uploaded artifact
//! <root>/<job_id>/output/result.json   written by the external process
//! ```
//!
//! Client-supplied file names never become paths. The whole directory is
//! removed by the [`CleanupManager`](crate::cleanup::CleanupManager).

use std::path::{Path, PathBuf};

use murmur_core::types::JobId;

/// File name the external process must write its result to.
pub const RESULT_FILE_NAME: &str = "result.json";

/// Errors from the storage layers (transient and result store).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("result for job {0} not found")]
    ResultNotFound(JobId),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Layout and writes for the transient root.
#[derive(Debug, Clone)]
pub struct TransientStorage {
    root: PathBuf,
}

impl TransientStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if missing.
    pub async fn init(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn input_path(&self, id: JobId, ext: &str) -> PathBuf {
        self.job_dir(id).join(format!("input.{ext}"))
    }

    pub fn output_dir(&self, id: JobId) -> PathBuf {
        self.job_dir(id).join("output")
    }

    /// Where the external process is expected to leave its result.
    pub fn output_path(&self, id: JobId) -> PathBuf {
        self.output_dir(id).join(RESULT_FILE_NAME)
    }

    /// Write the uploaded artifact into a fresh job directory.
    ///
    /// On failure the partially created directory is removed again, so a
    /// failed intake leaves no files behind.
    pub async fn persist_input(
        &self,
        id: JobId,
        ext: &str,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let output_dir = self.output_dir(id);
        let input_path = self.input_path(id, ext);

        let written = async {
            tokio::fs::create_dir_all(&output_dir)
                .await
                .map_err(|e| StorageError::io(&output_dir, e))?;
            tokio::fs::write(&input_path, data)
                .await
                .map_err(|e| StorageError::io(&input_path, e))
        }
        .await;

        if let Err(e) = written {
            let job_dir = self.job_dir(id);
            if let Err(rm) = tokio::fs::remove_dir_all(&job_dir).await {
                tracing::warn!(job_id = %id, error = %rm, "Failed to remove partial upload");
            }
            return Err(e);
        }

        Ok(input_path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
