use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::config::ShardConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Host, HostId, JobId, JobRecord, JobStore, JobTable, StatusCode};
use crate::shard::protocol::{HeartbeatRequest, HeartbeatResponse, ShardChannel};

/// What the shard believes it owns, as of the last successful sync.
///
/// Only advanced after a round trip succeeds; a failed heartbeat leaves it
/// untouched so the next attempt resends the same data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSyncState {
    pub known_job_ids: BTreeSet<JobId>,
    pub known_host_ids: BTreeSet<HostId>,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Highest generation the master has reported back
    pub acked_generation: u64,
}

impl ShardSyncState {
    /// Rebuild from the local job table at startup.
    pub fn from_store<S: JobStore>(store: &S) -> Self {
        Self {
            known_job_ids: store
                .all_jobs()
                .into_iter()
                .filter(|j| !j.is_complete())
                .map(|j| j.id)
                .collect(),
            ..Default::default()
        }
    }
}

/// Counts from applying one heartbeat response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub jobs_uploaded: usize,
    pub jobs_added: usize,
    pub jobs_updated: usize,
    pub jobs_skipped: usize,
    pub hosts_added: usize,
    pub hosts_removed: usize,
}

/// Translates between the shard's local job table and the master's heartbeat
/// protocol. Does no retrying of its own; see [`crate::shard::heartbeat`].
pub struct ShardSyncClient<S = JobTable> {
    config: ShardConfig,
    store: S,
    hosts: BTreeMap<HostId, Host>,
    suite_keyvals: BTreeMap<JobId, BTreeMap<String, String>>,
    state: ShardSyncState,
}

impl ShardSyncClient<JobTable> {
    pub fn new(config: ShardConfig) -> Self {
        let store = JobTable::with_capacity(config.max_jobs);
        Self::with_store(config, store)
    }
}

impl<S: JobStore> ShardSyncClient<S> {
    pub fn with_store(config: ShardConfig, store: S) -> Self {
        let state = ShardSyncState::from_store(&store);
        Self {
            config,
            store,
            hosts: BTreeMap::new(),
            suite_keyvals: BTreeMap::new(),
            state,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn set_throttle_incomplete_jobs_upload(&mut self, enabled: bool) {
        self.config.throttle_incomplete_jobs_upload = enabled;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn state(&self) -> &ShardSyncState {
        &self.state
    }

    pub fn hosts(&self) -> Vec<&Host> {
        self.hosts.values().collect()
    }

    pub fn suite_keyvals(&self, parent_id: JobId) -> Option<&BTreeMap<String, String>> {
        self.suite_keyvals.get(&parent_id)
    }

    /// Ids of local jobs that have not completed.
    ///
    /// With `throttle_incomplete_jobs_upload` on, only jobs whose generation is
    /// at or below `min_shard_generation` are reported.
    pub fn get_incomplete_job_ids(&self, min_shard_generation: u64) -> Vec<JobId> {
        let throttle = self.config.throttle_incomplete_jobs_upload;
        self.store
            .all_jobs()
            .into_iter()
            .filter(|j| !j.is_complete())
            .filter(|j| !throttle || j.shard_generation <= min_shard_generation)
            .map(|j| j.id)
            .collect()
    }

    /// Up to `limit` jobs that are both complete and stamped with a shard.
    pub fn get_jobs_to_upload(&self, limit: usize) -> Vec<JobRecord> {
        self.store
            .all_jobs()
            .into_iter()
            .filter(|j| j.is_complete() && j.shard_hostname.is_some())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Shard-side status write. When the status closes the job, completion
    /// and the shard stamp go out in the same update.
    pub fn set_status(
        &mut self,
        job_id: JobId,
        status: StatusCode,
        test_name: &str,
        reason: &str,
        aborted: bool,
    ) -> Result<()> {
        let job = self
            .store
            .get_job(job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        let mut update = job.status_update(status, test_name, reason, aborted)?;
        if update.complete == Some(true) {
            update.shard_hostname = Some(self.config.hostname.clone());
        }
        self.store.update_fields(job_id, update)?;
        tracing::debug!(job_id, status = %status, test_name, "Status recorded");
        Ok(())
    }

    pub fn build_heartbeat_request(&self) -> HeartbeatRequest {
        HeartbeatRequest {
            shard_hostname: self.config.hostname.clone(),
            known_job_ids: self.get_incomplete_job_ids(self.state.acked_generation),
            known_host_ids: self.hosts.keys().copied().collect(),
            jobs: self.get_jobs_to_upload(self.config.upload_limit),
        }
    }

    /// Apply a master response to the local tables.
    ///
    /// A job already known with the same dependency labels is an echo and is
    /// left alone. A known job with different labels gets the master's
    /// metadata but keeps its local statuses.
    pub fn process_heartbeat_response(&mut self, response: HeartbeatResponse) -> SyncSummary {
        let mut summary = SyncSummary::default();

        for job in response.jobs {
            if let Some(owner) = job.shard_hostname.as_deref() {
                if owner != self.config.hostname {
                    tracing::warn!(job_id = job.id, owner, "Ignoring job assigned to another shard");
                    summary.jobs_skipped += 1;
                    continue;
                }
            }

            match self.store.get_job(job.id).cloned() {
                Some(local) if local.dependency_labels == job.dependency_labels => {
                    tracing::debug!(job_id = job.id, "Job already known, skipping");
                    summary.jobs_skipped += 1;
                }
                Some(mut local) => {
                    local.refresh_metadata(&job);
                    self.store.upsert_job(local);
                    summary.jobs_updated += 1;
                }
                None => {
                    let job_id = job.id;
                    if self.store.upsert_job(job) {
                        tracing::debug!(job_id, "Job received from master");
                        summary.jobs_added += 1;
                    } else {
                        tracing::warn!(job_id, "Local job table at capacity, job dropped");
                    }
                }
            }
        }

        for host in response.hosts {
            if self.hosts.insert(host.id, host).is_none() {
                summary.hosts_added += 1;
            }
        }

        for host_id in response.incorrect_host_ids {
            if self.hosts.remove(&host_id).is_some() {
                tracing::info!(host_id, "Dropped host not assigned to this shard");
                summary.hosts_removed += 1;
            }
        }

        for keyval in response.suite_keyvals {
            self.suite_keyvals
                .entry(keyval.job_id)
                .or_default()
                .insert(keyval.key, keyval.value);
        }

        self.state.acked_generation = self.state.acked_generation.max(response.generation);
        summary
    }

    /// One full round trip: upload completed jobs, apply the response, then
    /// drop the uploaded jobs locally.
    pub async fn heartbeat<C: ShardChannel + ?Sized>(&mut self, channel: &C) -> Result<SyncSummary> {
        let request = self.build_heartbeat_request();
        let uploaded: Vec<JobId> = request.jobs.iter().map(|j| j.id).collect();

        let response = channel.heartbeat(request).await?;

        for job_id in &uploaded {
            self.store.remove_job(*job_id);
        }
        let mut summary = self.process_heartbeat_response(response);
        summary.jobs_uploaded = uploaded.len();

        self.state.known_job_ids = self.get_incomplete_job_ids(u64::MAX).into_iter().collect();
        self.state.known_host_ids = self.hosts.keys().copied().collect();
        self.state.last_sync_time = Some(Utc::now());

        tracing::info!(
            shard = %self.config.hostname,
            uploaded = summary.jobs_uploaded,
            added = summary.jobs_added,
            skipped = summary.jobs_skipped,
            "Heartbeat complete"
        );
        Ok(summary)
    }
}
