use std::time::Duration;

/// Shard-side synchronization settings.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Hostname this shard reports to the master
    pub hostname: String,
    /// Delay between successful heartbeats
    pub heartbeat_interval_ms: u64,
    /// Maximum number of completed jobs uploaded per heartbeat
    pub upload_limit: usize,
    /// Only report incomplete jobs at or below the acknowledged generation.
    /// Keeps an overloaded master from receiving the same job ids over and over.
    pub throttle_incomplete_jobs_upload: bool,
    /// First retry delay after a failed heartbeat
    pub backoff_initial_ms: u64,
    /// Upper bound on the retry delay
    pub backoff_max_ms: u64,
    /// Capacity of the local job table
    pub max_jobs: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            heartbeat_interval_ms: 60_000,
            upload_limit: 100,
            throttle_incomplete_jobs_upload: false,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            max_jobs: 10_000,
        }
    }
}

impl ShardConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Result waiter settings.
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    /// Sleep between polls while jobs are still pending
    pub poll_interval_ms: u64,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl WaiterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Owner recorded on every job the dispatcher creates
    pub owner: String,
    pub shard: ShardConfig,
    pub waiter: WaiterConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owner: "autotest_system".to_string(),
            shard: ShardConfig::default(),
            waiter: WaiterConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_shard_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.shard.hostname = hostname.into();
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.waiter.poll_interval_ms = poll_interval_ms;
        self
    }
}
