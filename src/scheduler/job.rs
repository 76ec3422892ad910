use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub type JobId = u64;

/// Test name of the synthetic top-level status for the whole server-side run.
pub const SERVER_JOB: &str = "SERVER_JOB";

/// Subdir sentinel for statuses that have no directory of their own.
pub const NO_SUBDIR: &str = "---";

/// Outcome code of a single test status row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Good,
    Fail,
    Error,
    TestNa,
    Abort,
}

impl StatusCode {
    /// GOOD and TEST_NA count as passing.
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Good | StatusCode::TestNa)
    }

    /// FAIL and ERROR are the retryable failures.
    pub fn is_failure(self) -> bool {
        matches!(self, StatusCode::Fail | StatusCode::Error)
    }

    /// Ordering used when collapsing several statuses into one verdict.
    pub fn severity(self) -> u8 {
        match self {
            StatusCode::Good => 0,
            StatusCode::TestNa => 1,
            StatusCode::Fail => 2,
            StatusCode::Error => 3,
            StatusCode::Abort => 4,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Good => write!(f, "GOOD"),
            StatusCode::Fail => write!(f, "FAIL"),
            StatusCode::Error => write!(f, "ERROR"),
            StatusCode::TestNa => write!(f, "TEST_NA"),
            StatusCode::Abort => write!(f, "ABORT"),
        }
    }
}

impl std::str::FromStr for StatusCode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GOOD" => Ok(StatusCode::Good),
            "FAIL" => Ok(StatusCode::Fail),
            "ERROR" => Ok(StatusCode::Error),
            "TEST_NA" => Ok(StatusCode::TestNa),
            "ABORT" => Ok(StatusCode::Abort),
            other => Err(SchedulerError::UnknownStatus(other.to_string())),
        }
    }
}

/// One immutable status record. Only ever appended to its parent job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatus {
    pub job_id: JobId,
    pub status: StatusCode,
    pub test_name: String,
    pub reason: String,
    pub subdir: String,
    pub job_tag: String,
    pub aborted: bool,
}

impl TestStatus {
    /// True for the SERVER_JOB row, including the `<job>_SERVER_JOB` form the
    /// aggregator produces. That form keeps the bare job tag as its subdir,
    /// which no ordinary test row has.
    pub fn is_server_job(&self) -> bool {
        if self.test_name == SERVER_JOB {
            return true;
        }
        self.subdir == self.job_tag
            && self
                .test_name
                .strip_suffix(SERVER_JOB)
                .is_some_and(|prefix| prefix.ends_with('_'))
    }

    pub fn is_terminal(&self) -> bool {
        self.subdir != NO_SUBDIR || self.is_server_job()
    }
}

/// A set of field writes applied to one job in a single step.
///
/// `complete` and `shard_hostname` travel together so a store can commit them
/// atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub statuses: Vec<TestStatus>,
    pub shard_hostname: Option<String>,
    pub complete: Option<bool>,
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub dependency_labels: BTreeSet<String>,
    pub shard_hostname: Option<String>,
    /// Generation stamped by the master when a shard claimed the job.
    #[serde(default)]
    pub shard_generation: u64,
    pub priority: i32,
    pub parent_job_id: Option<JobId>,
    #[serde(default)]
    pub keyvals: BTreeMap<String, String>,
    complete: bool,
    statuses: Vec<TestStatus>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new<I, S>(id: JobId, owner: impl Into<String>, dependency_labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            name: String::new(),
            owner: owner.into(),
            dependency_labels: dependency_labels.into_iter().map(Into::into).collect(),
            shard_hostname: None,
            shard_generation: 0,
            priority: 0,
            parent_job_id: None,
            keyvals: BTreeMap::new(),
            complete: false,
            statuses: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_shard(mut self, hostname: impl Into<String>, generation: u64) -> Self {
        self.shard_hostname = Some(hostname.into());
        self.shard_generation = generation;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Statuses in arrival order.
    pub fn statuses(&self) -> &[TestStatus] {
        &self.statuses
    }

    /// Execution tag: `<id>-<owner>/<shard or hostless>`.
    pub fn job_tag(&self) -> String {
        format!(
            "{}-{}/{}",
            self.id,
            self.owner,
            self.shard_hostname.as_deref().unwrap_or("hostless")
        )
    }

    /// Build the update that `set_status` would apply, without applying it.
    pub fn status_update(
        &self,
        status: StatusCode,
        test_name: &str,
        reason: &str,
        aborted: bool,
    ) -> Result<JobUpdate> {
        if self.complete {
            return Err(SchedulerError::JobClosed(self.id));
        }

        let server_job = test_name == SERVER_JOB;
        let record = TestStatus {
            job_id: self.id,
            status,
            test_name: test_name.to_string(),
            reason: reason.to_string(),
            subdir: if server_job {
                NO_SUBDIR.to_string()
            } else {
                test_name.to_string()
            },
            job_tag: self.job_tag(),
            aborted,
        };

        Ok(JobUpdate {
            statuses: vec![record],
            shard_hostname: None,
            complete: server_job.then_some(true),
        })
    }

    /// Append a status. A SERVER_JOB status closes the job.
    pub fn set_status(
        &mut self,
        status: StatusCode,
        test_name: &str,
        reason: &str,
        aborted: bool,
    ) -> Result<()> {
        let update = self.status_update(status, test_name, reason, aborted)?;
        self.apply_update(update)
    }

    /// Apply every field of `update`, or none of them.
    ///
    /// A complete job never reopens, and a job only completes once every
    /// status it holds is terminal.
    pub fn apply_update(&mut self, update: JobUpdate) -> Result<()> {
        if self.complete && (!update.statuses.is_empty() || update.complete == Some(false)) {
            return Err(SchedulerError::JobClosed(self.id));
        }
        if let Some(status) = update.statuses.iter().find(|s| s.job_id != self.id) {
            return Err(SchedulerError::Internal(format!(
                "status for job {} applied to job {}",
                status.job_id, self.id
            )));
        }
        if update.complete.unwrap_or(self.complete)
            && !self
                .statuses
                .iter()
                .chain(&update.statuses)
                .all(TestStatus::is_terminal)
        {
            return Err(SchedulerError::NonTerminalStatuses(self.id));
        }

        self.statuses.extend(update.statuses);
        if let Some(hostname) = update.shard_hostname {
            self.shard_hostname = Some(hostname);
        }
        if let Some(complete) = update.complete {
            self.complete = complete;
        }
        Ok(())
    }

    /// Complete jobs must only hold terminal statuses.
    pub fn is_consistent(&self) -> bool {
        !self.complete || self.statuses.iter().all(TestStatus::is_terminal)
    }

    /// Copy master-owned metadata from `other`, keeping local progress.
    pub fn refresh_metadata(&mut self, other: &JobRecord) {
        self.name = other.name.clone();
        self.owner = other.owner.clone();
        self.dependency_labels = other.dependency_labels.clone();
        self.priority = other.priority;
        self.parent_job_id = other.parent_job_id;
        self.keyvals = other.keyvals.clone();
        self.shard_generation = other.shard_generation;
    }
}
