//! Shard side of the master/shard synchronization.
//!
//! - [`client::ShardSyncClient`]: translates the local job table to and from
//!   heartbeat messages
//! - [`heartbeat::ShardHeartbeat`]: the periodic loop that drives the client
//!   and owns retry/backoff
//! - [`protocol`]: wire types and the [`ShardChannel`] transport seam
//!
//! Delivery is at-least-once in both directions. Uploads that fail are sent
//! again on the next round, and jobs the shard does not report as known are
//! sent again by the master; both sides treat repeats as no-ops.

pub mod backoff;
pub mod client;
pub mod heartbeat;
pub mod protocol;

pub use client::{ShardSyncClient, ShardSyncState, SyncSummary};
pub use heartbeat::{HeartbeatStats, ShardHeartbeat};
pub use protocol::{HeartbeatRequest, HeartbeatResponse, ShardChannel, SuiteKeyval};
