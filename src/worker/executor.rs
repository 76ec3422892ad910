use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::InMemoryLab;
use crate::error::Result;
use crate::scheduler::{JobId, StatusCode, SERVER_JOB};

/// Scripted outcomes per test name.
///
/// Each run of a test consumes the next entry; the last entry repeats once
/// the script runs out. Tests without a script pass.
#[derive(Debug, Clone, Default)]
pub struct OutcomeScript {
    outcomes: HashMap<String, Vec<StatusCode>>,
    runs: HashMap<String, usize>,
}

impl OutcomeScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcomes<I>(mut self, test: impl Into<String>, outcomes: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.outcomes
            .insert(test.into(), outcomes.into_iter().collect());
        self
    }

    /// Always fail.
    pub fn failing(self, test: impl Into<String>) -> Self {
        self.with_outcomes(test, [StatusCode::Fail])
    }

    /// Fail the first run, pass afterwards.
    pub fn flaky(self, test: impl Into<String>) -> Self {
        self.with_outcomes(test, [StatusCode::Fail, StatusCode::Good])
    }

    fn next_outcome(&mut self, test: &str) -> StatusCode {
        let run = self.runs.entry(test.to_string()).or_insert(0);
        let status = match self.outcomes.get(test) {
            Some(script) if !script.is_empty() => script[(*run).min(script.len() - 1)],
            _ => StatusCode::Good,
        };
        *run += 1;
        status
    }
}

/// Result of one fake test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub test_name: String,
    pub status: StatusCode,
}

/// Stands in for real DUTs: picks up runnable jobs from the lab and records
/// scripted test statuses followed by a passing SERVER_JOB.
pub struct DryRunExecutor {
    lab: InMemoryLab,
    script: OutcomeScript,
    poll_interval: Duration,
}

impl DryRunExecutor {
    pub fn new(lab: InMemoryLab, script: OutcomeScript) -> Self {
        Self {
            lab,
            script,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run every job that is currently runnable.
    pub async fn run_once(&mut self) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::new();
        for job in self.lab.runnable_jobs().await {
            let test_name = job.name.rsplit('/').next().unwrap_or(&job.name).to_string();
            let status = self.script.next_outcome(&test_name);
            tracing::info!(job_id = job.id, test = %test_name, %status, "Executing job");

            self.lab.start_job(job.id).await?;
            let reason = if status.is_success() {
                String::new()
            } else {
                format!("{} reported {}", test_name, status)
            };
            self.lab
                .record_status(job.id, status, &test_name, &reason)
                .await?;
            self.lab
                .record_status(job.id, StatusCode::Good, SERVER_JOB, "")
                .await?;

            results.push(ExecutionResult {
                job_id: job.id,
                test_name,
                status,
            });
        }
        Ok(results)
    }

    /// Poll for runnable jobs until cancelled. Returns the number of jobs run.
    pub async fn run(mut self, cancel: CancellationToken) -> usize {
        let mut executed = 0;
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(executed, "Executor shutting down");
                    return executed;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(results) => executed += results.len(),
                        Err(e) => tracing::error!(error = %e, "Executor pass failed"),
                    }
                }
            }
        }
    }
}
