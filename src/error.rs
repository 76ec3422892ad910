use thiserror::Error;

use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job {0} is already complete")]
    JobClosed(JobId),

    #[error("Job {0} cannot complete while it holds non-terminal statuses")]
    NonTerminalStatuses(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Not enough DUTs for board {board} in pool {pool}: required {required}, available {available}")]
    NotEnoughDuts {
        board: String,
        pool: String,
        required: usize,
        available: usize,
    },

    #[error("Invalid suite spec: {0}")]
    InvalidSuiteSpec(String),

    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    #[error("Unknown test status: {0}")]
    UnknownStatus(String),

    #[error("Malformed status row for job {job_id}: {reason}")]
    MalformedRow { job_id: JobId, reason: String },

    #[error("Records rejected by master: {0}")]
    UnallowedRecords(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Transient errors are safe to retry from an outer control loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::BackendUnavailable(_) | SchedulerError::Rpc(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
