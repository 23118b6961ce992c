//! Job record, lifecycle status, and the transition function.
//!
//! Every write to a job goes through [`Job::apply`]. It enforces the
//! lifecycle graph below and rejects any mutation of a terminal job, which
//! is what makes a late completion report from an already-cancelled job a
//! no-op.
//!
//! ```text
//! Queued ──start──> Processing ──complete──> Completed
//!   │                   │ └──────fail──────> Failed
//!   └──────cancel───────┴──────cancel──────> Cancelled
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Step label for a job waiting for a concurrency slot.
pub const STEP_QUEUED: &str = "queued";

/// Step label between spawn and the first detected stage.
pub const STEP_STARTING: &str = "starting";

pub const STEP_COMPLETED: &str = "completed";
pub const STEP_FAILED: &str = "failed";
pub const STEP_CANCELLED: &str = "cancelled";

/// Highest progress a job may report before it is `Completed`.
pub const MAX_ACTIVE_PROGRESS: u8 = 99;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// `Completed`, `Failed`, and `Cancelled` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Unknown job status '{s}'. Must be one of: queued, processing, completed, failed, cancelled"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Optional submission parameters forwarded to the external process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct JobParams {
    /// Expected number of distinct speakers, if known.
    #[validate(range(min = 1, max = 32))]
    pub num_speakers: Option<u32>,
    /// Language hint (e.g. `en`, `pt-BR`).
    #[validate(length(min = 2, max = 16))]
    pub language: Option<String>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked from submission to a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Advisory label for the current stage.
    pub step: String,
    /// 0..=100, non-decreasing while processing.
    pub progress: u8,
    pub params: JobParams,
    pub original_filename: String,
    pub input_bytes: u64,
    /// Transient input artifact; deleted by cleanup.
    pub input_ref: PathBuf,
    /// Committed result artifact; set iff `status == Completed`.
    pub result_ref: Option<PathBuf>,
    pub error_detail: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

/// A single state-machine operation applied through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMutation {
    /// `Queued -> Processing`.
    Start,
    /// Advisory progress while processing. Regressions are ignored.
    Progress { step: String, progress: u8 },
    /// `Processing -> Completed`.
    Complete { result_ref: PathBuf },
    /// `Processing -> Failed`.
    Fail { error: String },
    /// `Queued | Processing -> Cancelled`.
    Cancel,
}

impl JobMutation {
    fn action(&self) -> &'static str {
        match self {
            JobMutation::Start => "start",
            JobMutation::Progress { .. } => "report progress for",
            JobMutation::Complete { .. } => "complete",
            JobMutation::Fail { .. } => "fail",
            JobMutation::Cancel => "cancel",
        }
    }
}

/// Why a mutation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The job already reached a terminal status; the write is stale.
    #[error("job is already {0}")]
    Terminal(JobStatus),

    /// The edge does not exist in the lifecycle graph.
    #[error("cannot {action} a job in status {from}")]
    Illegal {
        action: &'static str,
        from: JobStatus,
    },
}

impl Job {
    /// Create a freshly queued job.
    pub fn new(
        id: JobId,
        input_ref: PathBuf,
        original_filename: impl Into<String>,
        input_bytes: u64,
        params: JobParams,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            step: STEP_QUEUED.to_string(),
            progress: 0,
            params,
            original_filename: original_filename.into(),
            input_bytes,
            input_ref,
            result_ref: None,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a mutation, enforcing the lifecycle graph.
    ///
    /// A rejected mutation leaves the job untouched.
    pub fn apply(&mut self, mutation: JobMutation) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }

        let illegal = TransitionError::Illegal {
            action: mutation.action(),
            from: self.status,
        };

        match mutation {
            JobMutation::Start => {
                if self.status != JobStatus::Queued {
                    return Err(illegal);
                }
                self.status = JobStatus::Processing;
                self.step = STEP_STARTING.to_string();
                self.started_at = Some(Utc::now());
            }
            JobMutation::Progress { step, progress } => {
                if self.status != JobStatus::Processing {
                    return Err(illegal);
                }
                let progress = progress.min(MAX_ACTIVE_PROGRESS);
                if progress >= self.progress {
                    self.progress = progress;
                    self.step = step;
                }
            }
            JobMutation::Complete { result_ref } => {
                if self.status != JobStatus::Processing {
                    return Err(illegal);
                }
                self.status = JobStatus::Completed;
                self.step = STEP_COMPLETED.to_string();
                self.progress = 100;
                self.result_ref = Some(result_ref);
                self.completed_at = Some(Utc::now());
            }
            JobMutation::Fail { error } => {
                if self.status != JobStatus::Processing {
                    return Err(illegal);
                }
                self.status = JobStatus::Failed;
                self.step = STEP_FAILED.to_string();
                self.error_detail = Some(error);
                self.completed_at = Some(Utc::now());
            }
            JobMutation::Cancel => {
                self.status = JobStatus::Cancelled;
                self.step = STEP_CANCELLED.to_string();
                self.completed_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    /// Read-only projection served to polling clients.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            status: self.status,
            step: self.step.clone(),
            progress: self.progress,
            error: self.error_detail.clone(),
            terminal: self.status.is_terminal(),
            original_filename: self.original_filename.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Status/polling view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub step: String,
    pub progress: u8,
    pub error: Option<String>,
    pub terminal: bool,
    pub original_filename: String,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
