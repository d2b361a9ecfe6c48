// Raft configuration
// Timing and storage settings shared by every group served through openraft

use std::path::PathBuf;
use std::time::Duration;

use zeroth_common::GroupId;

#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Election timeout in milliseconds (default: 1000ms)
    /// A follower that hears nothing from the leader for this long starts an election
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 250ms)
    pub heartbeat_interval_ms: u64,

    /// Interval of the group ticker in milliseconds (default: 100ms)
    pub tick_interval_ms: u64,

    /// Number of log entries before a snapshot is taken
    pub snapshot_threshold: u64,

    /// Deadline of a single raft RPC in milliseconds (default: 5000ms)
    pub rpc_request_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Root directory; each group gets its own subdirectory
    pub data_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1000,
            heartbeat_interval_ms: 250,
            tick_interval_ms: 100,
            snapshot_threshold: 10000,
            rpc_request_timeout_ms: 5000,
            max_payload_entries: 300,
            data_dir: PathBuf::from("./data/raft"),
        }
    }
}

impl RaftConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    /// Directory of one group
    pub fn group_dir(&self, gid: GroupId) -> PathBuf {
        self.data_dir.join(gid.to_string())
    }

    pub fn log_dir(&self, gid: GroupId) -> PathBuf {
        self.group_dir(gid).join("logs")
    }

    pub fn state_machine_dir(&self, gid: GroupId) -> PathBuf {
        self.group_dir(gid).join("state")
    }

    /// Ensure the directories of `gid` exist
    pub fn ensure_dirs(&self, gid: GroupId) -> std::io::Result<()> {
        std::fs::create_dir_all(self.log_dir(gid))?;
        std::fs::create_dir_all(self.state_machine_dir(gid))?;
        Ok(())
    }

    /// Convert to openraft Config
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "zeroth".to_string(),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        }
    }
}
