use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::JobId;

pub type HostId = u64;

pub fn board_label(board: &str) -> String {
    format!("board:{}", board)
}

pub fn pool_label(pool: &str) -> String {
    format!("pool:{}", pool)
}

/// A device under test known to the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub labels: BTreeSet<String>,
    pub locked: bool,
    pub shard_hostname: Option<String>,
}

impl Host {
    pub fn new<I, S>(id: HostId, hostname: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            hostname: hostname.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            locked: false,
            shard_hostname: None,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HqeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl std::fmt::Display for HqeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HqeStatus::Queued => write!(f, "queued"),
            HqeStatus::Running => write!(f, "running"),
            HqeStatus::Completed => write!(f, "completed"),
            HqeStatus::Failed => write!(f, "failed"),
            HqeStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Join record between a job and one machine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostQueueEntry {
    pub id: u64,
    pub job_id: JobId,
    pub status: HqeStatus,
    pub complete: bool,
    pub aborted: bool,
    pub finished_on: Option<DateTime<Utc>>,
}

impl HostQueueEntry {
    pub fn new(id: u64, job_id: JobId) -> Self {
        Self {
            id,
            job_id,
            status: HqeStatus::Queued,
            complete: false,
            aborted: false,
            finished_on: None,
        }
    }

    pub fn finish(&mut self, status: HqeStatus) {
        self.status = status;
        self.complete = true;
        self.finished_on = Some(Utc::now());
    }

    /// Out-of-band abort: the entry is done and flagged.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.finish(HqeStatus::Aborted);
    }
}
