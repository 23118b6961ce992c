//! Process supervisor: runs one job's external process to completion.
//!
//! For each job the supervisor
//!
//! 1. moves it `Queued -> Processing`,
//! 2. spawns the configured command,
//! 3. reads stdout and stderr line by line (see [`OutputLineCodec`]),
//!    feeding a [`StageTracker`],
//! 4. interprets the exit and commits the result,
//! 5. runs cleanup exactly once, whatever happened above (panics included).
//!
//! Every status write goes through the registry, which drops writes to
//! jobs that have already reached a terminal status. A cancellation that
//! lands first therefore always wins over the process outcome.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use murmur_core::job::{JobMutation, JobStatus};
use murmur_core::stages::StageTracker;
use murmur_core::transcript::TranscriptResult;
use murmur_core::types::JobId;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupManager;
use crate::config::{EngineConfig, ProcessCommand};
use crate::process::{self, Invocation, OutputLineCodec, StderrTail};
use crate::registry::{JobRegistry, RegistryError};
use crate::results::ResultStore;
use crate::storage::{StorageError, TransientStorage};

/// Upper bound on reading leftover output once the process has exited.
/// Guards against grandchildren that keep the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a supervised run did not produce a result.
///
/// The `Display` text becomes the job's error detail.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with {status}{}", tail_suffix(.stderr_tail))]
    Process { status: String, stderr_tail: String },

    #[error("result missing")]
    ResultMissing(PathBuf),

    #[error("result invalid: {0}")]
    ResultInvalid(String),

    #[error("timed out after {0}s")]
    TimedOut(u64),

    /// The engine shut down while the process was running.
    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("supervisor panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn tail_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

/// Final disposition of one supervised job, as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// Another terminal write (a cancellation) got there first.
    Superseded(JobStatus),
}

/// Per-engine supervisor. Cheap to share; one `run` call per job.
pub struct Supervisor {
    registry: Arc<dyn JobRegistry>,
    storage: Arc<TransientStorage>,
    results: Arc<ResultStore>,
    cleanup: CleanupManager,
    command: ProcessCommand,
    cancel_grace: Duration,
    process_timeout: Option<Duration>,
    stderr_tail_lines: usize,
}

impl Supervisor {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<dyn JobRegistry>,
        storage: Arc<TransientStorage>,
        results: Arc<ResultStore>,
        cleanup: CleanupManager,
    ) -> Self {
        Self {
            registry,
            storage,
            results,
            cleanup,
            command: config.command.clone(),
            cancel_grace: config.cancel_grace,
            process_timeout: config.process_timeout,
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }

    /// Supervise job `id` until it reaches a terminal status.
    ///
    /// Never returns an error: every failure is recorded on the job.
    /// Cleanup has always run by the time this returns.
    pub async fn run(&self, id: JobId, token: CancellationToken) -> JobOutcome {
        let executed = AssertUnwindSafe(self.execute(id, &token))
            .catch_unwind()
            .await;

        let outcome = match executed {
            Ok(Ok(result_ref)) => self.complete(id, result_ref).await,
            Ok(Err(SupervisorError::Registry(e))) if e.is_stale() => {
                tracing::info!(job_id = %id, "Job finished before it started");
                self.superseded(id).await
            }
            Ok(Err(e)) => self.fail(id, e).await,
            Err(panic) => self.fail(id, SupervisorError::Panicked(panic_message(&*panic))).await,
        };

        self.cleanup.cleanup(id).await;
        outcome
    }

    async fn execute(&self, id: JobId, token: &CancellationToken) -> Result<PathBuf, SupervisorError> {
        let job = self.registry.update(id, JobMutation::Start).await?;

        let output = self.storage.output_path(id);
        let output_dir = self.storage.output_dir(id);
        let invocation = Invocation {
            job_id: id,
            input: &job.input_ref,
            output: &output,
            output_dir: &output_dir,
            params: &job.params,
        };
        let mut cmd = process::build_command(&self.command, &invocation, &self.storage.job_dir(id));

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        tracing::info!(job_id = %id, pid = child.id(), program = %self.command.program, "Process started");

        self.watch(id, &mut child, token).await?;
        self.collect(id, output).await
    }

    /// Stream output until the process exits, is cancelled or times out.
    ///
    /// A non-zero exit comes back as [`SupervisorError::Process`] carrying
    /// the stderr tail.
    async fn watch(
        &self,
        id: JobId,
        child: &mut Child,
        token: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut stdout = child
            .stdout
            .take()
            .map(|s| FramedRead::new(s, OutputLineCodec::default()));
        let mut stderr = child
            .stderr
            .take()
            .map(|s| FramedRead::new(s, OutputLineCodec::default()));
        let mut tracker = StageTracker::new();
        let mut tail = StderrTail::new(self.stderr_tail_lines);

        let deadline = async {
            match self.process_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => self.observe(id, &mut tracker, &line).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        self.observe(id, &mut tracker, &line).await;
                        tail.push(&line);
                    }
                    None => stderr = None,
                },
                status = child.wait() => break status?,
                _ = token.cancelled() => {
                    tracing::info!(job_id = %id, "Terminating process");
                    process::terminate(child, self.cancel_grace).await?;
                    return Err(SupervisorError::Interrupted);
                }
                _ = &mut deadline => {
                    let secs = self.process_timeout.map(|d| d.as_secs()).unwrap_or_default();
                    tracing::warn!(job_id = %id, timeout_secs = secs, "Process timed out");
                    process::terminate(child, self.cancel_grace).await?;
                    return Err(SupervisorError::TimedOut(secs));
                }
            }
        };

        let drain = async {
            while let Some(line) = next_line(&mut stdout).await {
                self.observe(id, &mut tracker, &line).await;
            }
            while let Some(line) = next_line(&mut stderr).await {
                self.observe(id, &mut tracker, &line).await;
                tail.push(&line);
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!(job_id = %id, "Output still open after exit, not draining further");
        }

        tracing::info!(job_id = %id, %status, "Process exited");
        if status.success() {
            Ok(())
        } else {
            Err(status_error(status, tail))
        }
    }

    /// Feed one output line to stage detection and publish progress.
    async fn observe(&self, id: JobId, tracker: &mut StageTracker, line: &str) {
        tracing::trace!(job_id = %id, line, "Process output");
        let Some(update) = tracker.observe(line) else {
            return;
        };
        tracing::debug!(
            job_id = %id,
            stage = update.stage.ordinal(),
            step = %update.step,
            progress = update.progress,
            "Stage detected",
        );
        let mutation = JobMutation::Progress {
            step: update.step,
            progress: update.progress,
        };
        match self.registry.update(id, mutation).await {
            Ok(_) => {}
            Err(e) if e.is_stale() => {}
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to record progress"),
        }
    }

    /// Locate, validate and commit the result of a successful run.
    async fn collect(&self, id: JobId, output: PathBuf) -> Result<PathBuf, SupervisorError> {
        let bytes = match tokio::fs::read(&output).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SupervisorError::ResultMissing(output))
            }
            Err(e) => return Err(SupervisorError::Io(e)),
        };

        let result = TranscriptResult::from_json(&bytes)
            .and_then(TranscriptResult::normalize)
            .map_err(|e| SupervisorError::ResultInvalid(e.to_string()))?;

        let unusual = result.nonstandard_speakers();
        if !unusual.is_empty() {
            tracing::warn!(job_id = %id, speakers = ?unusual, "Result uses non-standard speaker labels");
        }

        Ok(self.results.commit(id, &result).await?)
    }

    // -----------------------------------------------------------------------
    // Terminal writes
    // -----------------------------------------------------------------------

    async fn complete(&self, id: JobId, result_ref: PathBuf) -> JobOutcome {
        match self.registry.update(id, JobMutation::Complete { result_ref }).await {
            Ok(_) => {
                tracing::info!(job_id = %id, "Job completed");
                JobOutcome::Completed
            }
            Err(e) => {
                // The result must not outlive a job that did not complete.
                if let Err(rm) = self.results.remove(id).await {
                    tracing::warn!(job_id = %id, error = %rm, "Failed to discard result");
                }
                if e.is_stale() {
                    tracing::info!(job_id = %id, "Completion dropped, job already terminal");
                    self.superseded(id).await
                } else {
                    tracing::error!(job_id = %id, error = %e, "Failed to record completion");
                    JobOutcome::Failed(e.to_string())
                }
            }
        }
    }

    async fn fail(&self, id: JobId, error: SupervisorError) -> JobOutcome {
        let detail = error.to_string();
        match self
            .registry
            .update(id, JobMutation::Fail { error: detail.clone() })
            .await
        {
            Ok(_) => {
                tracing::warn!(job_id = %id, error = %detail, "Job failed");
                JobOutcome::Failed(detail)
            }
            Err(e) if e.is_stale() => {
                tracing::debug!(job_id = %id, error = %detail, "Failure dropped, job already terminal");
                self.superseded(id).await
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, detail = %detail, "Failed to record failure");
                JobOutcome::Failed(detail)
            }
        }
    }

    async fn superseded(&self, id: JobId) -> JobOutcome {
        let status = match self.registry.get(id).await {
            Ok(Some(job)) => job.status,
            _ => JobStatus::Cancelled,
        };
        JobOutcome::Superseded(status)
    }
}

/// Next line of a process stream, `None` once it is closed.
///
/// The codec never rejects content, so only a failing pipe ends the stream
/// early.
async fn next_line<R>(lines: &mut Option<FramedRead<R, OutputLineCodec>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let reader = lines.as_mut()?;
    match reader.next().await? {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read process output");
            None
        }
    }
}

fn status_error(status: std::process::ExitStatus, tail: StderrTail) -> SupervisorError {
    SupervisorError::Process {
        status: status.to_string(),
        stderr_tail: tail.render(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
