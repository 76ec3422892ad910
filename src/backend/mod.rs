//! Collaborator interfaces consumed by the scheduler core.
//!
//! - [`ResultBackend`]: per-job test status rows (the results database)
//! - [`InventoryBackend`]: job completion and host queue entries
//! - [`SuiteBackend`]: DUT capacity and job submission
//!
//! [`memory::InMemoryLab`] implements all three, plus the master end of the
//! shard heartbeat.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::{HostQueueEntry, JobId, StatusCode};
use crate::suite::SuiteSpec;

pub use memory::InMemoryLab;

/// One raw status row as stored by the results database.
///
/// Rows coming off the wire go through [`StatusRow::from_json`]; a missing or
/// mistyped field is rejected there instead of surfacing later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    /// Row index, unique per job
    pub test_idx: u64,
    pub status: StatusCode,
    pub test_name: String,
    pub reason: String,
    pub subdir: String,
    pub job_tag: String,
    pub aborted: bool,
    /// Name of the job that produced the row
    pub job_name: String,
}

impl StatusRow {
    pub fn from_json(job_id: JobId, value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| SchedulerError::MalformedRow {
            job_id,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Status rows for a job in arrival order. Empty for jobs that have not
    /// reported anything yet.
    async fn get_job_test_statuses(&self, job_id: JobId) -> Result<Vec<StatusRow>>;
}

#[async_trait]
pub trait InventoryBackend: Send + Sync {
    /// The subset of `ids` whose jobs have finished. One call per poll.
    async fn get_finished_jobs(&self, ids: &[JobId]) -> Result<Vec<JobId>>;

    async fn get_host_queue_entries(&self, job_id: JobId) -> Result<Vec<HostQueueEntry>>;
}

/// A child job the dispatcher wants created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub owner: String,
    pub priority: i32,
    pub dependency_labels: BTreeSet<String>,
    pub keyvals: BTreeMap<String, String>,
    pub parent_job_id: Option<JobId>,
}

#[async_trait]
pub trait SuiteBackend: Send + Sync {
    /// Unlocked DUTs carrying the board and pool labels.
    async fn available_duts(&self, board: &str, pool: &str) -> Result<usize>;

    /// Register a suite run and return its id. Children reference it as
    /// their parent.
    async fn create_suite(&self, spec: &SuiteSpec, owner: &str) -> Result<JobId>;

    async fn create_job(&self, request: JobRequest) -> Result<JobId>;
}
