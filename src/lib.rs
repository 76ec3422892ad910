pub mod backend;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shard;
pub mod shutdown;
pub mod status;
pub mod suite;
pub mod worker;

pub use error::{Result, SchedulerError};
