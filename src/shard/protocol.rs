use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::{Host, HostId, JobId, JobRecord};

/// Keyval attached to a suite (parent) job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteKeyval {
    pub job_id: JobId,
    pub key: String,
    pub value: String,
}

/// Shard to master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub shard_hostname: String,
    pub known_job_ids: Vec<JobId>,
    pub known_host_ids: Vec<HostId>,
    /// Completed jobs being uploaded
    pub jobs: Vec<JobRecord>,
}

/// Master to shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub hosts: Vec<Host>,
    pub jobs: Vec<JobRecord>,
    pub suite_keyvals: Vec<SuiteKeyval>,
    #[serde(default)]
    pub incorrect_host_ids: Vec<HostId>,
    /// Highest job generation the master has handed out
    #[serde(default)]
    pub generation: u64,
}

impl HeartbeatResponse {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Request/response channel to the master. Implementations surface transport
/// failures as transient errors and never retry on their own.
#[async_trait]
pub trait ShardChannel: Send + Sync {
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse>;
}
