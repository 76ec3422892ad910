use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{InventoryBackend, JobRequest, ResultBackend, StatusRow, SuiteBackend};
use crate::error::{Result, SchedulerError};
use crate::scheduler::assigner::ShardAssigner;
use crate::scheduler::{
    board_label, pool_label, Host, HostId, HostQueueEntry, HqeStatus, JobId, JobRecord, JobStore,
    JobTable, JobUpdate, StatusCode, SERVER_JOB,
};
use crate::shard::protocol::{HeartbeatRequest, HeartbeatResponse, ShardChannel, SuiteKeyval};
use crate::suite::SuiteSpec;

const DEFAULT_SHARD_TIMEOUT_MS: u64 = 5 * 60 * 1000;

#[derive(Debug)]
struct LabState {
    jobs: JobTable,
    hqes: BTreeMap<JobId, Vec<HostQueueEntry>>,
    hosts: Vec<Host>,
    shards: ShardAssigner,
    suite_keyvals: BTreeMap<JobId, BTreeMap<String, String>>,
    next_job_id: JobId,
    next_host_id: HostId,
    next_hqe_id: u64,
    generation: u64,
    rpc_failures: u32,
    finished_queries: u64,
    status_queries: u64,
}

impl Default for LabState {
    fn default() -> Self {
        Self {
            jobs: JobTable::new(),
            hqes: BTreeMap::new(),
            hosts: Vec::new(),
            shards: ShardAssigner::new(DEFAULT_SHARD_TIMEOUT_MS),
            suite_keyvals: BTreeMap::new(),
            next_job_id: 1,
            next_host_id: 1,
            next_hqe_id: 1,
            generation: 0,
            rpc_failures: 0,
            finished_queries: 0,
            status_queries: 0,
        }
    }
}

impl LabState {
    fn allocate_job_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    fn insert_job(&mut self, job: JobRecord) -> Result<JobId> {
        let id = job.id;
        if !self.jobs.upsert_job(job) {
            return Err(SchedulerError::BackendUnavailable(
                "job table at capacity".to_string(),
            ));
        }
        let entry = HostQueueEntry::new(self.next_hqe_id, id);
        self.next_hqe_id += 1;
        self.hqes.insert(id, vec![entry]);
        Ok(id)
    }

    /// Close out every open entry of a job once the job itself is complete.
    fn finish_entries(&mut self, job_id: JobId) {
        let failed = self
            .jobs
            .get_job(job_id)
            .map(|j| j.statuses().iter().any(|s| !s.status.is_success()))
            .unwrap_or(false);
        let status = if failed {
            HqeStatus::Failed
        } else {
            HqeStatus::Completed
        };
        for entry in self.hqes.entry(job_id).or_default() {
            if !entry.complete {
                entry.finish(status);
            }
        }
    }

    fn is_finished(&self, job_id: JobId) -> bool {
        self.hqes
            .get(&job_id)
            .map(|entries| !entries.is_empty() && entries.iter().all(|e| e.complete))
            .unwrap_or(false)
    }

    /// Check an upload against the master's records before touching anything.
    ///
    /// The update is dry-run on a copy of the master record, so a batch that
    /// passes every check cannot fail halfway through being applied.
    fn check_upload(&self, shard: &str, job: &JobRecord) -> Result<()> {
        let master = match self.jobs.get_job(job.id) {
            None => {
                return Err(SchedulerError::UnallowedRecords(format!(
                    "job {} from shard {} does not exist on the master",
                    job.id, shard
                )))
            }
            Some(master) if master.shard_hostname.as_deref() != Some(shard) => {
                return Err(SchedulerError::UnallowedRecords(format!(
                    "job {} is assigned to shard {:?}, cannot update it from shard {}",
                    job.id, master.shard_hostname, shard
                )))
            }
            Some(master) => master,
        };
        if master.is_complete() {
            return Ok(());
        }

        master
            .clone()
            .apply_update(upload_update(master, job))
            .map_err(|e| {
                SchedulerError::UnallowedRecords(format!(
                    "job {} from shard {} rejected: {}",
                    job.id, shard, e
                ))
            })
    }

    fn accept_upload(&mut self, shard: &str, job: JobRecord) -> Result<()> {
        let Some(master) = self.jobs.get_job(job.id) else {
            return Err(SchedulerError::JobNotFound(job.id));
        };
        if master.is_complete() {
            tracing::debug!(job_id = job.id, shard, "Duplicate upload ignored");
            return Ok(());
        }

        let update = upload_update(master, &job);
        self.jobs.update_fields(job.id, update)?;
        self.finish_entries(job.id);
        self.shards.job_uploaded(shard, job.id);
        tracing::info!(job_id = job.id, shard, "Job results uploaded");
        Ok(())
    }
}

/// Statuses the master has not seen yet, closing the job.
fn upload_update(master: &JobRecord, job: &JobRecord) -> JobUpdate {
    JobUpdate {
        statuses: job
            .statuses()
            .iter()
            .skip(master.statuses().len())
            .cloned()
            .collect(),
        shard_hostname: None,
        complete: Some(true),
    }
}

/// Minimal in-memory master: job and host inventory, result rows, and the
/// master end of the shard heartbeat. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLab {
    state: Arc<RwLock<LabState>>,
}

impl InMemoryLab {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host<I, S>(&self, hostname: &str, labels: I) -> HostId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write().await;
        let id = state.next_host_id;
        state.next_host_id += 1;
        state.hosts.push(Host::new(id, hostname, labels));
        id
    }

    /// Add `count` unlocked DUTs for a board and pool.
    pub async fn add_duts(&self, board: &str, pool: &str, count: usize) -> Vec<HostId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let hostname = format!("{}-{}-host{}", board, pool, i + 1);
            let id = self
                .add_host(&hostname, [board_label(board), pool_label(pool)])
                .await;
            ids.push(id);
        }
        ids
    }

    pub async fn lock_host(&self, host_id: HostId) -> Result<()> {
        let mut state = self.state.write().await;
        let host = state
            .hosts
            .iter_mut()
            .find(|h| h.id == host_id)
            .ok_or_else(|| SchedulerError::Internal(format!("host {} not found", host_id)))?;
        host.locked = true;
        Ok(())
    }

    pub async fn register_shard<I, S>(&self, hostname: &str, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.write().await.shards.register_shard(hostname, labels);
    }

    /// Shards that have not sent a heartbeat within the timeout.
    pub async fn dead_shards(&self) -> Vec<String> {
        self.state.read().await.shards.check_dead_shards()
    }

    /// Create a bare job with one queue entry.
    pub async fn create_job_with_labels<I, S>(&self, owner: &str, labels: I) -> Result<JobId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write().await;
        let id = state.allocate_job_id();
        let job = JobRecord::new(id, owner, labels).with_name(format!("job-{}", id));
        state.insert_job(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Option<JobRecord> {
        self.state.read().await.jobs.get_job(job_id).cloned()
    }

    pub async fn all_jobs(&self) -> Vec<JobRecord> {
        self.state
            .read()
            .await
            .jobs
            .all_jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Children of a suite in submission order
    pub async fn child_jobs(&self, suite_id: JobId) -> Vec<JobRecord> {
        self.state
            .read()
            .await
            .jobs
            .jobs_for_parent(suite_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn suite_keyvals(&self, suite_id: JobId) -> Option<BTreeMap<String, String>> {
        self.state.read().await.suite_keyvals.get(&suite_id).cloned()
    }

    /// Jobs waiting to run locally: not claimed by a shard, not complete and
    /// with at least one queued entry. Started jobs are not handed out again.
    pub async fn runnable_jobs(&self) -> Vec<JobRecord> {
        let state = self.state.read().await;
        state
            .jobs
            .all_jobs()
            .into_iter()
            .filter(|j| j.shard_hostname.is_none() && !j.is_complete())
            .filter(|j| {
                state
                    .hqes
                    .get(&j.id)
                    .map(|entries| {
                        entries.iter().any(|e| e.status == HqeStatus::Queued)
                            && !entries.iter().any(|e| e.status == HqeStatus::Running)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Mark a job's open entries as running.
    pub async fn start_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.write().await;
        let entries = state
            .hqes
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        for entry in entries.iter_mut().filter(|e| !e.complete) {
            entry.status = HqeStatus::Running;
        }
        Ok(())
    }

    /// Append a status to a job. The SERVER_JOB status closes the job and
    /// finishes its queue entries.
    pub async fn record_status(
        &self,
        job_id: JobId,
        status: StatusCode,
        test_name: &str,
        reason: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_job_mut(job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        job.set_status(status, test_name, reason, false)?;
        if job.is_complete() {
            state.finish_entries(job_id);
        }
        Ok(())
    }

    /// Out-of-band abort of every entry of a job.
    pub async fn abort_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_job_mut(job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        if !job.is_complete() {
            job.set_status(StatusCode::Abort, SERVER_JOB, "Job aborted", true)?;
        }
        for entry in state.hqes.entry(job_id).or_default() {
            entry.abort();
        }
        tracing::info!(job_id, "Job aborted");
        Ok(())
    }

    /// Add another queue entry to a job. Returns the entry id.
    pub async fn add_host_queue_entry(&self, job_id: JobId) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.jobs.get_job(job_id).is_none() {
            return Err(SchedulerError::JobNotFound(job_id));
        }
        let id = state.next_hqe_id;
        state.next_hqe_id += 1;
        state
            .hqes
            .entry(job_id)
            .or_default()
            .push(HostQueueEntry::new(id, job_id));
        Ok(id)
    }

    /// Abort a single queue entry, leaving the job's other entries alone.
    pub async fn abort_host_queue_entry(&self, job_id: JobId, entry_id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .hqes
            .get_mut(&job_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == entry_id))
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        entry.abort();
        Ok(())
    }

    /// Make the next `count` heartbeats fail with a transport error.
    pub async fn inject_rpc_failures(&self, count: u32) {
        self.state.write().await.rpc_failures = count;
    }

    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Number of batched finished-job queries served
    pub async fn finished_queries(&self) -> u64 {
        self.state.read().await.finished_queries
    }

    /// Number of status-row queries served
    pub async fn status_queries(&self) -> u64 {
        self.state.read().await.status_queries
    }
}

#[async_trait]
impl ResultBackend for InMemoryLab {
    async fn get_job_test_statuses(&self, job_id: JobId) -> Result<Vec<StatusRow>> {
        let mut state = self.state.write().await;
        state.status_queries += 1;
        let job = state
            .jobs
            .get_job(job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        Ok(job
            .statuses()
            .iter()
            .enumerate()
            .map(|(i, s)| StatusRow {
                test_idx: i as u64 + 1,
                status: s.status,
                test_name: s.test_name.clone(),
                reason: s.reason.clone(),
                subdir: s.subdir.clone(),
                job_tag: s.job_tag.clone(),
                aborted: s.aborted,
                job_name: job.name.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl InventoryBackend for InMemoryLab {
    async fn get_finished_jobs(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut state = self.state.write().await;
        state.finished_queries += 1;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.is_finished(*id))
            .collect())
    }

    async fn get_host_queue_entries(&self, job_id: JobId) -> Result<Vec<HostQueueEntry>> {
        Ok(self
            .state
            .read()
            .await
            .hqes
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SuiteBackend for InMemoryLab {
    async fn available_duts(&self, board: &str, pool: &str) -> Result<usize> {
        let board = board_label(board);
        let pool = pool_label(pool);
        Ok(self
            .state
            .read()
            .await
            .hosts
            .iter()
            .filter(|h| !h.locked && h.has_label(&board) && h.has_label(&pool))
            .count())
    }

    async fn create_suite(&self, spec: &SuiteSpec, owner: &str) -> Result<JobId> {
        let mut keyvals = spec.job_keyvals().clone();
        if let Some(build) = spec.builds().values().next() {
            keyvals.insert("build".to_string(), build.clone());
        }
        keyvals.insert("suite".to_string(), spec.suite_name().to_string());
        keyvals.insert("builds".to_string(), serde_json::to_string(spec.builds())?);
        keyvals.insert("owner".to_string(), owner.to_string());

        let mut state = self.state.write().await;
        let id = state.allocate_job_id();
        state.suite_keyvals.insert(id, keyvals);
        tracing::info!(suite_id = id, suite = spec.suite_name(), "Suite created");
        Ok(id)
    }

    async fn create_job(&self, request: JobRequest) -> Result<JobId> {
        let mut state = self.state.write().await;
        let id = state.allocate_job_id();
        let mut job = JobRecord::new(id, request.owner, request.dependency_labels)
            .with_name(request.name);
        job.priority = request.priority;
        job.parent_job_id = request.parent_job_id;
        job.keyvals = request.keyvals;
        state.insert_job(job)
    }
}

#[async_trait]
impl ShardChannel for InMemoryLab {
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mut state = self.state.write().await;
        if state.rpc_failures > 0 {
            state.rpc_failures -= 1;
            return Err(SchedulerError::Rpc("connection reset by peer".to_string()));
        }

        let shard = request.shard_hostname.as_str();
        if !state.shards.shard_heartbeat(shard) {
            return Err(SchedulerError::UnallowedRecords(format!(
                "heartbeat from unknown shard {}",
                shard
            )));
        }

        for job in &request.jobs {
            state.check_upload(shard, job)?;
        }
        for job in request.jobs {
            state.accept_upload(shard, job)?;
        }

        let LabState {
            jobs,
            hosts,
            shards,
            suite_keyvals,
            generation,
            ..
        } = &mut *state;

        let next_generation = *generation + 1;
        if !shards.assign_jobs(jobs, shard, next_generation).is_empty() {
            *generation = next_generation;
        }
        shards.assign_hosts(hosts, shard);

        let known_jobs: HashSet<JobId> = request.known_job_ids.iter().copied().collect();
        let known_hosts: HashSet<HostId> = request.known_host_ids.iter().copied().collect();

        let jobs_out: Vec<JobRecord> = jobs
            .jobs_for_shard(shard)
            .into_iter()
            .filter(|j| !j.is_complete() && !known_jobs.contains(&j.id))
            .cloned()
            .collect();

        let shard_hosts: HashSet<HostId> = hosts
            .iter()
            .filter(|h| h.shard_hostname.as_deref() == Some(shard))
            .map(|h| h.id)
            .collect();
        let hosts_out: Vec<Host> = hosts
            .iter()
            .filter(|h| shard_hosts.contains(&h.id) && !known_hosts.contains(&h.id))
            .cloned()
            .collect();
        let mut incorrect_host_ids: Vec<HostId> = known_hosts
            .iter()
            .copied()
            .filter(|id| !shard_hosts.contains(id))
            .collect();
        incorrect_host_ids.sort_unstable();

        let parents: std::collections::BTreeSet<JobId> =
            jobs_out.iter().filter_map(|j| j.parent_job_id).collect();
        let suite_keyvals_out: Vec<SuiteKeyval> = parents
            .into_iter()
            .filter_map(|parent| suite_keyvals.get(&parent).map(|kv| (parent, kv)))
            .flat_map(|(parent, kv)| {
                kv.iter().map(move |(key, value)| SuiteKeyval {
                    job_id: parent,
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();

        tracing::debug!(
            shard,
            jobs = jobs_out.len(),
            hosts = hosts_out.len(),
            generation = *generation,
            "Heartbeat served"
        );

        Ok(HeartbeatResponse {
            hosts: hosts_out,
            jobs: jobs_out,
            suite_keyvals: suite_keyvals_out,
            incorrect_host_ids,
            generation: *generation,
        })
    }
}
