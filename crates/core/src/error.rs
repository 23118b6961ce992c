use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: JobId },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// The result was requested before the job reached a terminal state.
    #[error("Job {id} is not ready (status: {status})")]
    NotReady { id: JobId, status: JobStatus },

    /// The result was requested for a job that ended `Failed` or `Cancelled`.
    #[error("Job {id} ended with status {status}: {error}")]
    JobFailed {
        id: JobId,
        status: JobStatus,
        error: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a missing job.
    pub fn job_not_found(id: JobId) -> Self {
        CoreError::NotFound { entity: "Job", id }
    }

    /// The job this error refers to, if any. Used for client correlation.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CoreError::NotFound { id, .. }
            | CoreError::NotReady { id, .. }
            | CoreError::JobFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CoreError::Validation(errors.to_string())
    }
}
