//! Job registry: the only shared mutable state in the engine.
//!
//! [`JobRegistry`] is a trait so a persistent store can replace the
//! in-memory default without touching callers. Every status or progress
//! write goes through [`JobRegistry::update`], which applies a
//! [`JobMutation`] under the registry lock via [`Job::apply`]. That single
//! "check non-terminal, then write" step is what resolves the race between
//! cancellation and natural completion: the first terminal write wins and
//! later ones come back as [`TransitionError::Terminal`].

use std::collections::HashMap;

use async_trait::async_trait;
use murmur_core::error::CoreError;
use murmur_core::job::{Job, JobMutation, JobStatus, TransitionError};
use murmur_core::types::JobId;
use tokio::sync::RwLock;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    /// The mutation was rejected by the lifecycle state machine.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The backing store failed (unused by the in-memory registry).
    #[error("registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Whether the write was dropped because the job had already finished.
    pub fn is_stale(&self) -> bool {
        matches!(self, RegistryError::Transition(TransitionError::Terminal(_)))
    }
}

impl From<RegistryError> for CoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => CoreError::job_not_found(id),
            RegistryError::Duplicate(id) => CoreError::Conflict(format!("job {id} already exists")),
            RegistryError::Transition(e) => CoreError::Conflict(e.to_string()),
            RegistryError::Backend(msg) => CoreError::Internal(msg),
        }
    }
}

/// Concurrency-safe keyed store of jobs.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a new job. Rejects a duplicate id.
    async fn create(&self, job: Job) -> Result<(), RegistryError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, RegistryError>;

    /// Atomically apply `mutation` and return the updated job.
    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job, RegistryError>;

    /// All jobs in creation order, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RegistryError>;

    /// Remove a job, returning it if it existed.
    async fn delete(&self, id: JobId) -> Result<Option<Job>, RegistryError>;
}

/// Default registry: a `HashMap` behind a Tokio `RwLock`.
///
/// Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn create(&self, job: Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::Duplicate(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, RegistryError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> Result<Job, RegistryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        job.apply(mutation)?;
        Ok(job.clone())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, RegistryError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        // Ties broken by the time-ordered v7 id.
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>, RegistryError> {
        Ok(self.jobs.write().await.remove(&id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use murmur_core::job::JobParams;
    use murmur_core::types::new_job_id;

    use super::*;

    fn job() -> Job {
        Job::new(
            new_job_id(),
            PathBuf::from("/tmp/in.wav"),
            "in.wav",
            10,
            JobParams::default(),
        )
    }

    #[tokio::test]
    async fn create_get_delete() {
        let registry = InMemoryRegistry::new();
        let job = job();
        let id = job.id;

        registry.create(job).await.unwrap();
        assert_eq!(registry.get(id).await.unwrap().unwrap().status, JobStatus::Queued);

        assert!(registry.delete(id).await.unwrap().is_some());
        assert!(registry.get(id).await.unwrap().is_none());
        assert!(registry.delete(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = InMemoryRegistry::new();
        let job = job();
        registry.create(job.clone()).await.unwrap();
        assert_matches!(registry.create(job).await, Err(RegistryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let registry = InMemoryRegistry::new();
        assert_matches!(
            registry.update(new_job_id(), JobMutation::Start).await,
            Err(RegistryError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn rejected_update_is_stale_after_terminal() {
        let registry = InMemoryRegistry::new();
        let job = job();
        let id = job.id;
        registry.create(job).await.unwrap();
        registry.update(id, JobMutation::Cancel).await.unwrap();

        let err = registry.update(id, JobMutation::Start).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(registry.get(id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn list_filters_by_status_in_creation_order() {
        let registry = InMemoryRegistry::new();
        let a = job();
        let b = job();
        let (a_id, b_id) = (a.id, b.id);
        registry.create(a).await.unwrap();
        registry.create(b).await.unwrap();
        registry.update(b_id, JobMutation::Start).await.unwrap();

        let all: Vec<JobId> = registry.list(None).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(all, vec![a_id, b_id]);

        let processing = registry.list(Some(JobStatus::Processing)).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, b_id);
    }

    #[tokio::test]
    async fn concurrent_terminal_writes_resolve_to_exactly_one() {
        let registry = Arc::new(InMemoryRegistry::new());
        let job = job();
        let id = job.id;
        registry.create(job).await.unwrap();
        registry.update(id, JobMutation::Start).await.unwrap();

        let cancel = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.update(id, JobMutation::Cancel).await })
        };
        let complete = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .update(
                        id,
                        JobMutation::Complete {
                            result_ref: PathBuf::from("/r.json"),
                        },
                    )
                    .await
            })
        };

        let cancel = cancel.await.unwrap();
        let complete = complete.await.unwrap();
        assert_ne!(cancel.is_ok(), complete.is_ok(), "exactly one terminal write wins");

        let final_job = registry.get(id).await.unwrap().unwrap();
        match final_job.status {
            JobStatus::Cancelled => assert!(final_job.result_ref.is_none()),
            JobStatus::Completed => assert!(final_job.result_ref.is_some()),
            other => panic!("unexpected status {other}"),
        }
    }
}
