use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based): doubles from `initial_ms`,
/// capped at `max_ms`, with up to 25% random jitter subtracted so shards
/// that failed together do not retry together.
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base_ms = initial_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter_ms = if base_ms >= 4 {
        rand::thread_rng().gen_range(0..=base_ms / 4)
    } else {
        0
    };
    Duration::from_millis(base_ms - jitter_ms)
}
