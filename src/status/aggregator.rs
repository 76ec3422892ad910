use std::collections::HashSet;
use std::path::Path;

use crate::backend::{ResultBackend, StatusRow};
use crate::error::Result;
use crate::scheduler::{JobId, TestStatus, SERVER_JOB};

/// Turns raw result rows into normalized [`TestStatus`] events.
pub struct StatusAggregator<R> {
    backend: R,
}

impl<R: ResultBackend> StatusAggregator<R> {
    pub fn new(backend: R) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &R {
        &self.backend
    }

    /// Snapshot of a job's results as of this call, in arrival order.
    ///
    /// The rows are fetched once; conversion happens as the iterator is
    /// consumed. A job with no rows yields nothing.
    pub async fn yield_job_results(&self, job_id: JobId) -> Result<JobResults> {
        let rows = self.backend.get_job_test_statuses(job_id).await?;
        tracing::debug!(job_id, rows = rows.len(), "Fetched test statuses");
        Ok(JobResults {
            job_id,
            rows: rows.into_iter(),
            seen: HashSet::new(),
        })
    }
}

/// Lazy iterator over one job's normalized statuses.
pub struct JobResults {
    job_id: JobId,
    rows: std::vec::IntoIter<StatusRow>,
    seen: HashSet<u64>,
}

impl Iterator for JobResults {
    type Item = TestStatus;

    fn next(&mut self) -> Option<TestStatus> {
        loop {
            let row = self.rows.next()?;
            if !self.seen.insert(row.test_idx) {
                continue;
            }
            return Some(normalize_row(self.job_id, row));
        }
    }
}

/// SERVER_JOB rows are renamed to `<job_name>_SERVER_JOB` and keep the bare
/// job tag as their subdir. Every other row's subdir is joined under the tag.
pub fn normalize_row(job_id: JobId, row: StatusRow) -> TestStatus {
    let (test_name, subdir) = if row.test_name == SERVER_JOB {
        (format!("{}_{}", row.job_name, row.test_name), row.job_tag.clone())
    } else {
        let subdir = Path::new(&row.job_tag)
            .join(&row.subdir)
            .to_string_lossy()
            .into_owned();
        (row.test_name, subdir)
    };

    TestStatus {
        job_id,
        status: row.status,
        test_name,
        reason: row.reason,
        subdir,
        job_tag: row.job_tag,
        aborted: row.aborted,
    }
}
