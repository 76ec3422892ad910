use std::collections::HashMap;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{JobId, JobRecord, JobUpdate};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Storage for job records.
///
/// `update_fields` is the only write path for an existing job and must apply
/// the whole [`JobUpdate`] as one unit.
pub trait JobStore {
    fn get_job(&self, id: JobId) -> Option<&JobRecord>;

    /// All jobs ordered by id.
    fn all_jobs(&self) -> Vec<&JobRecord>;

    /// Insert or replace a job. Returns false if the store is at capacity.
    fn upsert_job(&mut self, job: JobRecord) -> bool;

    fn update_fields(&mut self, id: JobId, update: JobUpdate) -> Result<()>;

    fn remove_job(&mut self, id: JobId) -> Option<JobRecord>;
}

/// In-memory job table
#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
    max_jobs: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    pub fn get_job_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&id)
    }

    /// Jobs claimed by a specific shard
    pub fn jobs_for_shard(&self, hostname: &str) -> Vec<&JobRecord> {
        self.all_jobs()
            .into_iter()
            .filter(|j| j.shard_hostname.as_deref() == Some(hostname))
            .collect()
    }

    /// Children of a suite, in submission order
    pub fn jobs_for_parent(&self, parent_id: JobId) -> Vec<&JobRecord> {
        self.all_jobs()
            .into_iter()
            .filter(|j| j.parent_job_id == Some(parent_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}

impl JobStore for JobTable {
    fn get_job(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    fn all_jobs(&self) -> Vec<&JobRecord> {
        let mut jobs: Vec<&JobRecord> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    fn upsert_job(&mut self, job: JobRecord) -> bool {
        if !self.jobs.contains_key(&job.id) && self.is_full() {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    fn update_fields(&mut self, id: JobId, update: JobUpdate) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        job.apply_update(update)
    }

    fn remove_job(&mut self, id: JobId) -> Option<JobRecord> {
        self.jobs.remove(&id)
    }
}
