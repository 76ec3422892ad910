use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ShardConfig;
use crate::scheduler::JobStore;
use crate::shard::backoff::backoff_delay;
use crate::shard::client::ShardSyncClient;
use crate::shard::protocol::ShardChannel;

/// Counters for one run of the heartbeat loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub successes: u64,
    pub failures: u64,
}

/// Shard main loop: heartbeats on a fixed interval and backs off
/// exponentially while the master is unreachable.
pub struct ShardHeartbeat {
    interval: Duration,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
}

impl ShardHeartbeat {
    pub fn new(config: &ShardConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            backoff_initial_ms: config.backoff_initial_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }

    /// Run until `shutdown` is cancelled. The first heartbeat goes out
    /// immediately.
    pub async fn run<S, C>(
        &self,
        client: &mut ShardSyncClient<S>,
        channel: &C,
        shutdown: CancellationToken,
    ) -> HeartbeatStats
    where
        S: JobStore,
        C: ShardChannel + ?Sized,
    {
        let mut stats = HeartbeatStats::default();
        let mut consecutive_failures = 0u32;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(shard = client.hostname(), "Heartbeat loop stopped");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match client.heartbeat(channel).await {
                Ok(_) => {
                    stats.successes += 1;
                    consecutive_failures = 0;
                    delay = self.interval;
                }
                Err(e) => {
                    stats.failures += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    delay = backoff_delay(
                        consecutive_failures,
                        self.backoff_initial_ms,
                        self.backoff_max_ms,
                    );
                    if e.is_transient() {
                        tracing::warn!(
                            shard = client.hostname(),
                            error = %e,
                            attempt = consecutive_failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "Heartbeat failed, backing off"
                        );
                    } else {
                        tracing::error!(
                            shard = client.hostname(),
                            error = %e,
                            attempt = consecutive_failures,
                            "Heartbeat rejected by master"
                        );
                    }
                }
            }
        }

        stats
    }
}
