//! Orchestrator facade: the operations transports call.
//!
//! Owns every engine component and the dispatcher task. All methods take
//! `&self` and are safe to call concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_core::error::CoreError;
use murmur_core::job::{Job, JobMutation, JobParams, JobSnapshot, JobStatus};
use murmur_core::transcript::TranscriptResult;
use murmur_core::types::{new_job_id, JobId};
use murmur_core::upload::validate_params;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveJobs;
use crate::cleanup::CleanupManager;
use crate::config::EngineConfig;
use crate::dispatcher::JobDispatcher;
use crate::queue::IntakeQueue;
use crate::registry::{InMemoryRegistry, JobRegistry};
use crate::results::ResultStore;
use crate::storage::{StorageError, TransientStorage};
use crate::supervisor::Supervisor;

/// An uploaded artifact plus its submission parameters.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-supplied name. Used for validation and display only.
    pub filename: String,
    pub data: Vec<u8>,
    pub params: JobParams,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    /// `false` when the job was already terminal and nothing changed.
    pub cancelled: bool,
    pub job: JobSnapshot,
}

/// Point-in-time engine load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub queued: usize,
    pub active: usize,
    pub capacity: usize,
    /// Cleanup runs since start, across all jobs.
    pub cleanups: u64,
}

pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<dyn JobRegistry>,
    storage: Arc<TransientStorage>,
    results: Arc<ResultStore>,
    cleanup: CleanupManager,
    queue: Arc<IntakeQueue>,
    active: Arc<ActiveJobs>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create storage roots, build the engine with an in-memory registry
    /// and start the dispatcher.
    pub async fn start(config: EngineConfig) -> Result<Arc<Self>, StorageError> {
        Self::with_registry(config, Arc::new(InMemoryRegistry::new())).await
    }

    /// Like [`start`](Self::start) with a caller-provided registry.
    pub async fn with_registry(
        config: EngineConfig,
        registry: Arc<dyn JobRegistry>,
    ) -> Result<Arc<Self>, StorageError> {
        let storage = Arc::new(TransientStorage::new(&config.transient_dir));
        let results = Arc::new(ResultStore::new(&config.result_dir));
        storage.init().await?;
        results.init().await?;

        let cleanup = CleanupManager::new(Arc::clone(&storage));
        let queue = Arc::new(IntakeQueue::bounded(config.max_queued_jobs));
        let shutdown = CancellationToken::new();
        let active = Arc::new(ActiveJobs::new(shutdown.clone()));

        let supervisor = Arc::new(Supervisor::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&results),
            cleanup.clone(),
        ));
        let dispatcher = JobDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&active),
            supervisor,
            config.max_concurrent_jobs,
        );
        let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        tracing::info!(
            program = %config.command.program,
            transient_dir = %config.transient_dir.display(),
            result_dir = %config.result_dir.display(),
            max_concurrent_jobs = config.max_concurrent_jobs,
            "Orchestrator started",
        );

        Ok(Arc::new(Self {
            config,
            registry,
            storage,
            results,
            cleanup,
            queue,
            active,
            dispatcher: Mutex::new(Some(handle)),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Polling interval clients should use.
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Validate and persist an upload, register a Queued job and enqueue it.
    ///
    /// A rejected upload leaves no job and no files behind.
    pub async fn submit(&self, upload: Upload) -> Result<JobSnapshot, CoreError> {
        validate_params(&upload.params)?;
        let size = upload.data.len() as u64;
        let ext = self.config.upload.validate_file(&upload.filename, size)?;

        // Taken before any I/O; dropped (and released) on every early return.
        let slot = self
            .queue
            .reserve()
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;

        let id = new_job_id();
        let input_ref = self
            .storage
            .persist_input(id, &ext, &upload.data)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to store upload: {e}")))?;

        let job = Job::new(id, input_ref, upload.filename, size, upload.params);
        let snapshot = job.snapshot();
        if let Err(e) = self.registry.create(job).await {
            self.cleanup.cleanup(id).await;
            return Err(e.into());
        }
        self.queue.push(slot, id).await;

        tracing::info!(
            job_id = %id,
            filename = %snapshot.original_filename,
            bytes = size,
            "Job queued",
        );
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status(&self, id: JobId) -> Result<JobSnapshot, CoreError> {
        Ok(self.get(id).await?.snapshot())
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>, CoreError> {
        let jobs = self.registry.list(status).await?;
        Ok(jobs.iter().map(Job::snapshot).collect())
    }

    /// The committed result of a Completed job.
    pub async fn result(&self, id: JobId) -> Result<TranscriptResult, CoreError> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Completed => self.results.load(id).await.map_err(|e| {
                tracing::error!(job_id = %id, error = %e, "Committed result unreadable");
                CoreError::Internal(format!("Result for job {id} is unavailable"))
            }),
            JobStatus::Queued | JobStatus::Processing => Err(CoreError::NotReady {
                id,
                status: job.status,
            }),
            JobStatus::Failed => Err(CoreError::JobFailed {
                id,
                status: job.status,
                error: job.error_detail.unwrap_or_else(|| "job failed".into()),
            }),
            JobStatus::Cancelled => Err(CoreError::JobFailed {
                id,
                status: job.status,
                error: job
                    .error_detail
                    .unwrap_or_else(|| "job was cancelled".into()),
            }),
        }
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            queued: self.queue.len().await,
            active: self.active.len().await,
            capacity: self.config.max_concurrent_jobs,
            cleanups: self.cleanup.runs(),
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a queued or processing job.
    ///
    /// The Cancelled status is committed first; only then is the job pulled
    /// from the queue (and cleaned up here) or its supervisor signalled (and
    /// cleanup left to it). Cancelling a terminal job is acknowledged
    /// without changes.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        let job = self.get(id).await?;
        if job.is_terminal() {
            return Ok(CancelOutcome {
                cancelled: false,
                job: job.snapshot(),
            });
        }

        let job = match self.registry.update(id, JobMutation::Cancel).await {
            Ok(job) => job,
            Err(e) if e.is_stale() => {
                // Finished between the read and the write.
                return Ok(CancelOutcome {
                    cancelled: false,
                    job: self.get(id).await?.snapshot(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if self.queue.remove(id).await {
            self.cleanup.cleanup(id).await;
            tracing::info!(job_id = %id, "Queued job cancelled");
        } else {
            let signalled = self.active.cancel(id).await;
            tracing::info!(job_id = %id, signalled, "Processing job cancelled");
        }

        Ok(CancelOutcome {
            cancelled: true,
            job: job.snapshot(),
        })
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Drop terminal jobs that finished more than `retention` ago, along
    /// with their results. Returns how many jobs were removed.
    pub async fn purge_expired(&self, retention: Duration) -> Result<usize, CoreError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| CoreError::Internal(format!("Invalid retention: {e}")))?;
        let cutoff = Utc::now() - retention;

        let mut purged = 0;
        for job in self.registry.list(None).await? {
            let expired = job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            self.registry.delete(job.id).await?;
            if let Err(e) = self.results.remove(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to remove expired result");
            }
            self.cleanup.cleanup(job.id).await;
            purged += 1;
        }
        Ok(purged)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop dispatching, interrupt running processes and wait up to
    /// `timeout` for their supervisors to clean up.
    pub async fn shutdown(&self, timeout: Duration) {
        self.active.cancel_all();
        let Some(handle) = self.dispatcher.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => tracing::info!("Orchestrator stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Dispatcher task failed"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for running jobs to stop",
            ),
        }
    }

    async fn get(&self, id: JobId) -> Result<Job, CoreError> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(id))
    }
}
