pub mod assigner;
pub mod host;
pub mod job;
pub mod queue;

pub use host::{board_label, pool_label, Host, HostId, HostQueueEntry, HqeStatus};
pub use job::{JobId, JobRecord, JobUpdate, StatusCode, TestStatus, NO_SUBDIR, SERVER_JOB};
pub use queue::{JobStore, JobTable};
