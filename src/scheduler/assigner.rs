use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::scheduler::host::{Host, HostId};
use crate::scheduler::job::JobId;
use crate::scheduler::queue::{JobStore, JobTable};

/// Master-side view of one shard
#[derive(Debug, Clone)]
pub struct ShardState {
    pub hostname: String,
    pub labels: BTreeSet<String>,
    pub last_heartbeat: Instant,
    pub job_ids: HashSet<JobId>,
}

impl ShardState {
    pub fn new(hostname: String, labels: BTreeSet<String>) -> Self {
        Self {
            hostname,
            labels,
            last_heartbeat: Instant::now(),
            job_ids: HashSet::new(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.last_heartbeat.elapsed().as_millis() < timeout_ms as u128
    }

    /// A shard serves anything carrying at least one of its labels.
    pub fn serves(&self, labels: &BTreeSet<String>) -> bool {
        !self.labels.is_disjoint(labels)
    }
}

/// Assigns jobs and hosts to shards
#[derive(Debug, Default)]
pub struct ShardAssigner {
    shards: HashMap<String, ShardState>,
    shard_timeout_ms: u64,
}

impl ShardAssigner {
    pub fn new(shard_timeout_ms: u64) -> Self {
        Self {
            shards: HashMap::new(),
            shard_timeout_ms,
        }
    }

    pub fn register_shard<I, S>(&mut self, hostname: &str, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = labels.into_iter().map(Into::into).collect();
        self.shards.insert(
            hostname.to_string(),
            ShardState::new(hostname.to_string(), labels),
        );
        tracing::info!(shard = hostname, "Shard registered");
    }

    /// Record a heartbeat. Returns false for unknown shards.
    pub fn shard_heartbeat(&mut self, hostname: &str) -> bool {
        match self.shards.get_mut(hostname) {
            Some(shard) => {
                shard.update_heartbeat();
                true
            }
            None => false,
        }
    }

    /// Claim every unassigned, incomplete job the shard serves, stamping it
    /// with `generation`. Returns the claimed ids.
    pub fn assign_jobs(
        &mut self,
        table: &mut JobTable,
        hostname: &str,
        generation: u64,
    ) -> Vec<JobId> {
        let Some(shard) = self.shards.get_mut(hostname) else {
            return Vec::new();
        };

        let job_ids: Vec<JobId> = table
            .all_jobs()
            .into_iter()
            .filter(|j| {
                j.shard_hostname.is_none() && !j.is_complete() && shard.serves(&j.dependency_labels)
            })
            .map(|j| j.id)
            .collect();

        for id in &job_ids {
            if let Some(job) = table.get_job_mut(*id) {
                job.shard_hostname = Some(hostname.to_string());
                job.shard_generation = generation;
                shard.job_ids.insert(*id);
                tracing::info!(job_id = id, shard = hostname, generation, "Job assigned to shard");
            }
        }
        job_ids
    }

    /// Claim unassigned hosts the shard serves. Returns the claimed ids.
    pub fn assign_hosts(&self, hosts: &mut [Host], hostname: &str) -> Vec<HostId> {
        let Some(shard) = self.shards.get(hostname) else {
            return Vec::new();
        };

        hosts
            .iter_mut()
            .filter(|h| h.shard_hostname.is_none() && shard.serves(&h.labels))
            .map(|h| {
                h.shard_hostname = Some(hostname.to_string());
                h.id
            })
            .collect()
    }

    /// Forget a job once its results came back from the shard
    pub fn job_uploaded(&mut self, hostname: &str, job_id: JobId) {
        if let Some(shard) = self.shards.get_mut(hostname) {
            shard.job_ids.remove(&job_id);
        }
    }

    /// Shards whose last heartbeat is older than the timeout
    pub fn check_dead_shards(&self) -> Vec<String> {
        let mut dead: Vec<String> = self
            .shards
            .values()
            .filter(|s| !s.is_alive(self.shard_timeout_ms))
            .map(|s| s.hostname.clone())
            .collect();
        dead.sort();
        dead
    }
}
