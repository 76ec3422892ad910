//! Shared fixtures for the integration tests.
//!
//! Provides a scripted result/inventory backend with call counters, small
//! builders for status rows and configs, and helpers for wiring a fake lab
//! to a dry-run executor.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use suite_scheduler::backend::{InMemoryLab, InventoryBackend, ResultBackend, StatusRow};
use suite_scheduler::config::{SchedulerConfig, ShardConfig, WaiterConfig};
use suite_scheduler::error::{Result, SchedulerError};
use suite_scheduler::scheduler::{HostQueueEntry, JobId, StatusCode, SERVER_JOB};
use suite_scheduler::worker::{DryRunExecutor, OutcomeScript};

pub const POLL_MS: u64 = 10;

/// Scheduler config with a short poll interval for tests
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_owner("chromeos-test")
        .with_poll_interval_ms(POLL_MS)
}

pub fn waiter_config() -> WaiterConfig {
    WaiterConfig {
        poll_interval_ms: POLL_MS,
    }
}

pub fn poll_interval() -> Duration {
    Duration::from_millis(POLL_MS)
}

/// Shard config with a fast heartbeat and small backoff
pub fn shard_config(hostname: &str) -> ShardConfig {
    ShardConfig {
        heartbeat_interval_ms: 1_000,
        backoff_initial_ms: 100,
        backoff_max_ms: 1_000,
        ..ShardConfig::new(hostname)
    }
}

pub fn row(test_idx: u64, status: StatusCode, test_name: &str, job_tag: &str) -> StatusRow {
    StatusRow {
        test_idx,
        status,
        test_name: test_name.to_string(),
        reason: String::new(),
        subdir: if test_name == SERVER_JOB {
            "---".to_string()
        } else {
            test_name.to_string()
        },
        job_tag: job_tag.to_string(),
        aborted: false,
        job_name: "test-job".to_string(),
    }
}

pub fn finished_entry(id: u64, job_id: JobId) -> HostQueueEntry {
    let mut entry = HostQueueEntry::new(id, job_id);
    entry.finish(suite_scheduler::scheduler::HqeStatus::Completed);
    entry
}

pub fn aborted_entry(id: u64, job_id: JobId) -> HostQueueEntry {
    let mut entry = HostQueueEntry::new(id, job_id);
    entry.abort();
    entry
}

#[derive(Default)]
struct ScriptedState {
    rows: HashMap<JobId, Vec<StatusRow>>,
    entries: HashMap<JobId, Vec<HostQueueEntry>>,
    /// Job finishes once this many finished-queries have been made
    finish_at_poll: HashMap<JobId, usize>,
    finished_calls: Vec<Vec<JobId>>,
    status_calls: usize,
    unavailable: HashSet<JobId>,
}

/// Result and inventory backend driven entirely by the test.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that reports finished on poll number `poll` (1-based).
    pub fn add_job(&self, job_id: JobId, poll: usize, rows: Vec<StatusRow>) {
        let mut state = self.state.lock().unwrap();
        state.rows.insert(job_id, rows);
        state.finish_at_poll.insert(job_id, poll);
        state
            .entries
            .insert(job_id, vec![finished_entry(job_id * 10, job_id)]);
    }

    pub fn set_entries(&self, job_id: JobId, entries: Vec<HostQueueEntry>) {
        self.state.lock().unwrap().entries.insert(job_id, entries);
    }

    /// Make status lookups for a job fail with a transient error.
    pub fn make_unavailable(&self, job_id: JobId) {
        self.state.lock().unwrap().unavailable.insert(job_id);
    }

    /// Ids passed to each finished-jobs query, in call order
    pub fn finished_calls(&self) -> Vec<Vec<JobId>> {
        self.state.lock().unwrap().finished_calls.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }
}

#[async_trait]
impl ResultBackend for ScriptedBackend {
    async fn get_job_test_statuses(&self, job_id: JobId) -> Result<Vec<StatusRow>> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if state.unavailable.contains(&job_id) {
            return Err(SchedulerError::BackendUnavailable("tko timeout".to_string()));
        }
        Ok(state.rows.get(&job_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl InventoryBackend for ScriptedBackend {
    async fn get_finished_jobs(&self, ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut state = self.state.lock().unwrap();
        state.finished_calls.push(ids.to_vec());
        let poll = state.finished_calls.len();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.finish_at_poll.get(id).is_some_and(|at| poll >= *at))
            .collect())
    }

    async fn get_host_queue_entries(&self, job_id: JobId) -> Result<Vec<HostQueueEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .entries
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Lab with `count` DUTs for one board in the given pool
pub async fn lab_with_duts(board: &str, pool: &str, count: usize) -> InMemoryLab {
    let lab = InMemoryLab::new();
    lab.add_duts(board, pool, count).await;
    lab
}

/// Start a dry-run executor against the lab. Cancel the token to stop it.
pub fn spawn_executor(
    lab: &InMemoryLab,
    script: OutcomeScript,
) -> (CancellationToken, JoinHandle<usize>) {
    let token = CancellationToken::new();
    let executor =
        DryRunExecutor::new(lab.clone(), script).with_poll_interval(Duration::from_millis(5));
    let handle = tokio::spawn(executor.run(token.clone()));
    (token, handle)
}
