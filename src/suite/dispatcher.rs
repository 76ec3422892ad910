use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use crate::backend::{InventoryBackend, JobRequest, ResultBackend, SuiteBackend};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{board_label, pool_label, JobId, StatusCode, TestStatus};
use crate::status::JobResultWaiter;
use crate::suite::spec::SuiteSpec;

/// One test declared by a suite, with the extra labels it needs on a DUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteTest {
    pub name: String,
    pub dependencies: BTreeSet<String>,
}

impl SuiteTest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_dependency(mut self, label: impl Into<String>) -> Self {
        self.dependencies.insert(label.into());
        self
    }
}

/// Outcome of one `(test, board)` pair after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub test: String,
    pub board: String,
    /// Every job submitted for this test, original first
    pub job_ids: Vec<JobId>,
    /// Most severe status of the last attempt; `None` if it reported nothing
    pub final_status: Option<StatusCode>,
    pub statuses: Vec<TestStatus>,
}

impl TestOutcome {
    pub fn is_success(&self) -> bool {
        self.final_status.is_some_and(StatusCode::is_success)
    }

    pub fn retries(&self) -> usize {
        self.job_ids.len().saturating_sub(1)
    }

    fn latest_job(&self) -> Option<JobId> {
        self.job_ids.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteOutcome {
    pub suite_id: JobId,
    pub suite_name: String,
    pub tests: Vec<TestOutcome>,
    pub timed_out: bool,
}

impl SuiteOutcome {
    /// True iff the suite finished in time and every test's final status passed.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.tests.iter().all(TestOutcome::is_success)
    }

    pub fn total_jobs(&self) -> usize {
        self.tests.iter().map(|t| t.job_ids.len()).sum()
    }
}

/// Per-run bookkeeping: which test each job belongs to and what to resubmit.
struct RunState {
    tests: Vec<TestOutcome>,
    requests: Vec<JobRequest>,
    job_index: HashMap<JobId, usize>,
    retried: HashSet<JobId>,
}

impl RunState {
    fn track(&mut self, idx: usize, job_id: JobId) {
        self.tests[idx].job_ids.push(job_id);
        self.job_index.insert(job_id, idx);
    }
}

/// Turns a [`SuiteSpec`] into child jobs, waits for their results and applies
/// the retry policy.
///
/// The backend is cloned into the result waiter, so it should be a cheap
/// handle onto shared state.
pub struct SuiteDispatcher<B> {
    backend: B,
    config: SchedulerConfig,
}

impl<B> SuiteDispatcher<B>
where
    B: SuiteBackend + InventoryBackend + ResultBackend + Clone,
{
    pub fn new(backend: B, config: SchedulerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fail with `NotEnoughDuts` unless every board has `minimum_duts`
    /// available in the suite's pool. Nothing is submitted on failure.
    pub async fn check_capacity(&self, spec: &SuiteSpec) -> Result<()> {
        for board in spec.builds().keys() {
            let available = self.backend.available_duts(board, spec.pool()).await?;
            if available < spec.minimum_duts() {
                return Err(SchedulerError::NotEnoughDuts {
                    board: board.clone(),
                    pool: spec.pool().to_string(),
                    required: spec.minimum_duts(),
                    available,
                });
            }
        }
        Ok(())
    }

    /// Run a suite to completion or timeout.
    ///
    /// Errors only when the suite could not be started or a backend call
    /// failed. Failing tests and timeouts are reported in the outcome.
    pub async fn run(&self, spec: &SuiteSpec, tests: &[SuiteTest]) -> Result<SuiteOutcome> {
        self.check_capacity(spec).await?;

        let suite_id = self.backend.create_suite(spec, &self.config.owner).await?;
        tracing::info!(
            suite_id,
            suite = spec.suite_name(),
            priority = %spec.priority(),
            tests = tests.len(),
            boards = spec.builds().len(),
            "Dispatching suite"
        );

        let mut run = RunState {
            tests: Vec::new(),
            requests: Vec::new(),
            job_index: HashMap::new(),
            retried: HashSet::new(),
        };

        for test in tests {
            for (board, build) in spec.builds() {
                let request = self.child_request(spec, suite_id, test, board, build)?;
                let job_id = self.backend.create_job(request.clone()).await?;
                tracing::debug!(job_id, test = %test.name, board = %board, "Child job created");

                run.tests.push(TestOutcome {
                    test: test.name.clone(),
                    board: board.clone(),
                    job_ids: Vec::new(),
                    final_status: None,
                    statuses: Vec::new(),
                });
                run.requests.push(request);
                run.track(run.tests.len() - 1, job_id);
            }
        }

        let mut waiter = JobResultWaiter::new(
            self.backend.clone(),
            self.backend.clone(),
            &self.config.waiter,
        );
        waiter.add_jobs(run.job_index.keys().copied());

        // None when the deadline is past what the clock can represent
        let deadline = tokio::time::Instant::now()
            .checked_add(Duration::from_secs(spec.timeout_mins().saturating_mul(60)));
        let mut timed_out = false;
        let mut unfinished = Vec::new();
        {
            let mut stream = waiter.wait_for_results();
            loop {
                let next = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, stream.next()).await,
                    None => Ok(stream.next().await),
                };
                let status = match next {
                    Ok(Some(status)) => status?,
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        unfinished = stream.pending_jobs();
                        tracing::warn!(
                            suite_id,
                            pending = unfinished.len(),
                            timeout_mins = spec.timeout_mins(),
                            "Suite timed out waiting for results"
                        );
                        break;
                    }
                };

                if let Some(job_id) = self.maybe_retry(spec, &mut run, &status).await? {
                    stream.add_jobs([job_id]);
                }
                if let Some(idx) = run.job_index.get(&status.job_id).copied() {
                    run.tests[idx].statuses.push(status);
                }
            }
        }

        let unfinished: HashSet<JobId> = unfinished.into_iter().collect();
        for test in &mut run.tests {
            test.final_status = match test.latest_job() {
                Some(job_id) if !unfinished.contains(&job_id) => test
                    .statuses
                    .iter()
                    .filter(|s| s.job_id == job_id)
                    .map(|s| s.status)
                    .max_by_key(|s| s.severity()),
                _ => None,
            };
        }

        let outcome = SuiteOutcome {
            suite_id,
            suite_name: spec.suite_name().to_string(),
            tests: run.tests,
            timed_out,
        };
        tracing::info!(
            suite_id,
            success = outcome.is_success(),
            jobs = outcome.total_jobs(),
            timed_out,
            "Suite finished"
        );
        Ok(outcome)
    }

    fn child_request(
        &self,
        spec: &SuiteSpec,
        suite_id: JobId,
        test: &SuiteTest,
        board: &str,
        build: &str,
    ) -> Result<JobRequest> {
        let mut dependency_labels = test.dependencies.clone();
        dependency_labels.insert(board_label(board));
        dependency_labels.insert(pool_label(spec.pool()));

        let mut keyvals = spec.job_keyvals().clone();
        keyvals.insert("build".to_string(), build.to_string());
        keyvals.insert("suite".to_string(), spec.suite_name().to_string());
        keyvals.insert("builds".to_string(), serde_json::to_string(spec.builds())?);

        Ok(JobRequest {
            name: format!("{}/{}/{}", build, spec.suite_name(), test.name),
            owner: self.config.owner.clone(),
            priority: spec.priority().value(),
            dependency_labels,
            keyvals,
            parent_job_id: Some(suite_id),
        })
    }

    /// Resubmit the test behind a failing status. Only the latest attempt of
    /// a test can trigger a retry, and only once.
    async fn maybe_retry(
        &self,
        spec: &SuiteSpec,
        run: &mut RunState,
        status: &TestStatus,
    ) -> Result<Option<JobId>> {
        if !spec.test_retry() || !status.status.is_failure() {
            return Ok(None);
        }
        let Some(idx) = run.job_index.get(&status.job_id).copied() else {
            return Ok(None);
        };
        let test = &run.tests[idx];
        if test.latest_job() != Some(status.job_id) || run.retried.contains(&status.job_id) {
            return Ok(None);
        }
        if test.retries() >= spec.max_retries() as usize {
            tracing::debug!(job_id = status.job_id, test = %test.test, "Retry budget exhausted");
            return Ok(None);
        }

        run.retried.insert(status.job_id);
        let job_id = self.backend.create_job(run.requests[idx].clone()).await?;
        tracing::info!(
            job_id,
            original = status.job_id,
            test = %run.tests[idx].test,
            attempt = run.tests[idx].job_ids.len() + 1,
            "Retrying failed test"
        );
        run.track(idx, job_id);
        Ok(Some(job_id))
    }
}
