//! Result store: committed transcripts keyed by job id.
//!
//! Lives under its own root, independent of transient storage, so results
//! survive input cleanup. Writes go to a temporary file first and are
//! renamed into place, so a reader never sees a half-written result.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use murmur_core::transcript::TranscriptResult;
use murmur_core::types::JobId;

use crate::storage::StorageError;

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    pub fn result_path(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Persist a normalised transcript and return its location.
    pub async fn commit(
        &self,
        id: JobId,
        result: &TranscriptResult,
    ) -> Result<PathBuf, StorageError> {
        let path = self.result_path(id);
        let tmp = self.root.join(format!(".{id}.json.tmp"));
        let body = serde_json::to_vec_pretty(result)?;

        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        Ok(path)
    }

    pub async fn load(&self, id: JobId) -> Result<TranscriptResult, StorageError> {
        let path = self.result_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ResultNotFound(id))
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Delete a committed result. Missing results are not an error.
    pub async fn remove(&self, id: JobId) -> Result<bool, StorageError> {
        let path = self.result_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use murmur_core::transcript::{ProcessingMetrics, Segment};
    use murmur_core::types::new_job_id;

    use super::*;

    fn transcript() -> TranscriptResult {
        TranscriptResult {
            segments: vec![Segment {
                start: 0.0,
                end: 1.5,
                speaker: "SPEAKER_00".into(),
                text: "Good morning".into(),
            }],
            metrics: ProcessingMetrics::default(),
        }
    }

    #[tokio::test]
    async fn commit_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path());
        let id = new_job_id();

        let path = store.commit(id, &transcript()).await.unwrap();
        assert_eq!(path, store.result_path(id));
        assert_eq!(store.load(id).await.unwrap(), transcript());
    }

    #[tokio::test]
    async fn load_missing_result() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path());
        assert_matches!(
            store.load(new_job_id()).await,
            Err(StorageError::ResultNotFound(_))
        );
    }

    #[tokio::test]
    async fn remove_is_tolerant_of_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path());
        let id = new_job_id();
        store.commit(id, &transcript()).await.unwrap();

        assert!(store.remove(id).await.unwrap());
        assert!(!store.remove(id).await.unwrap());
    }
}
