use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use crate::backend::{InventoryBackend, ResultBackend};
use crate::config::WaiterConfig;
use crate::error::Result;
use crate::scheduler::{HostQueueEntry, JobId, TestStatus};
use crate::status::aggregator::{JobResults, StatusAggregator};

/// True when a job was killed outright: it has entries and every one of them
/// is aborted. Such a job contributes no results.
pub fn all_entries_aborted(entries: &[HostQueueEntry]) -> bool {
    !entries.is_empty() && entries.iter().all(|e| e.aborted)
}

/// Tracks outstanding jobs and surfaces their results as they finish.
///
/// A job moves from pending, to finished (seen by a poll), to delivered (all
/// of its results handed out, id dropped). All state is local, so a result
/// stream can be dropped at any point without cleanup.
pub struct JobResultWaiter<A, R> {
    inventory: A,
    aggregator: StatusAggregator<R>,
    pending: BTreeSet<JobId>,
    poll_interval: Duration,
}

impl<A: InventoryBackend, R: ResultBackend> JobResultWaiter<A, R> {
    pub fn new(inventory: A, results: R, config: &WaiterConfig) -> Self {
        Self {
            inventory,
            aggregator: StatusAggregator::new(results),
            pending: BTreeSet::new(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn add_jobs<I: IntoIterator<Item = JobId>>(&mut self, jobs: I) {
        let before = self.pending.len();
        self.pending.extend(jobs);
        tracing::debug!(added = self.pending.len() - before, pending = self.pending.len(), "Tracking jobs");
    }

    pub fn pending_jobs(&self) -> Vec<JobId> {
        self.pending.iter().copied().collect()
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    /// Start a fresh pass over the currently pending jobs. Each call starts
    /// over from whatever is still tracked.
    pub fn wait_for_results(&mut self) -> ResultStream<'_, A, R> {
        ResultStream {
            waiter: self,
            ready: VecDeque::new(),
            current: None,
            sleep_before_poll: false,
        }
    }

    /// One batched query for every pending id.
    async fn poll_finished(&self) -> Result<Vec<JobId>> {
        let ids: Vec<JobId> = self.pending.iter().copied().collect();
        let finished = self.inventory.get_finished_jobs(&ids).await?;
        Ok(finished
            .into_iter()
            .filter(|id| self.pending.contains(id))
            .collect())
    }

    async fn open_job(&mut self, job_id: JobId) -> Result<Option<JobResults>> {
        let entries = self.inventory.get_host_queue_entries(job_id).await?;
        if all_entries_aborted(&entries) {
            tracing::info!(job_id, "Job aborted, dropping without results");
            self.pending.remove(&job_id);
            return Ok(None);
        }
        Ok(Some(self.aggregator.yield_job_results(job_id).await?))
    }
}

/// Results of one `wait_for_results` call. Ends once nothing is pending.
pub struct ResultStream<'a, A, R> {
    waiter: &'a mut JobResultWaiter<A, R>,
    ready: VecDeque<JobId>,
    current: Option<(JobId, JobResults)>,
    sleep_before_poll: bool,
}

impl<'a, A: InventoryBackend, R: ResultBackend> ResultStream<'a, A, R> {
    /// Track more jobs while the stream is being drained.
    pub fn add_jobs<I: IntoIterator<Item = JobId>>(&mut self, jobs: I) {
        self.waiter.add_jobs(jobs);
    }

    pub fn pending_jobs(&self) -> Vec<JobId> {
        self.waiter.pending_jobs()
    }

    /// Next status, sleeping between polls while jobs are still running.
    pub async fn next(&mut self) -> Option<Result<TestStatus>> {
        loop {
            if let Some((job_id, results)) = self.current.as_mut() {
                if let Some(status) = results.next() {
                    return Some(Ok(status));
                }
                let job_id = *job_id;
                self.current = None;
                self.waiter.pending.remove(&job_id);
                tracing::debug!(job_id, "Job results delivered");
                continue;
            }

            if let Some(job_id) = self.ready.pop_front() {
                match self.waiter.open_job(job_id).await {
                    Ok(Some(results)) => self.current = Some((job_id, results)),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            if self.waiter.pending.is_empty() {
                return None;
            }

            if self.sleep_before_poll {
                tokio::time::sleep(self.waiter.poll_interval).await;
            }

            match self.waiter.poll_finished().await {
                Ok(finished) => {
                    self.sleep_before_poll = true;
                    if !finished.is_empty() {
                        tracing::debug!(finished = ?finished, "Jobs finished");
                    }
                    self.ready.extend(finished);
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Drain everything into a vector, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<TestStatus>> {
        let mut results = Vec::new();
        while let Some(status) = self.next().await {
            results.push(status?);
        }
        Ok(results)
    }
}
