/*!
 * Process Configuration
 *
 * Command-line flags, each with an environment variable fallback.
 */

use crate::engine::EngineConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "cinder")]
#[command(about = "Replicated Redis-protocol key-value store", long_about = None)]
pub struct Config {
    /// Address clients connect to
    #[arg(long = "server", env = "CINDER_SERVER", default_value = crate::DEFAULT_ADDR)]
    pub server: String,

    /// Directory for the raft journal and snapshots
    #[arg(long = "raftdir", env = "CINDER_RAFT_DIR", default_value = "./")]
    pub raft_dir: PathBuf,

    /// Address the raft transport binds
    #[arg(long = "raftbind", env = "CINDER_RAFT_BIND", default_value = crate::DEFAULT_RAFT_ADDR)]
    pub raft_bind: String,

    /// Raft address announced to peers (defaults to the bound address)
    #[arg(long = "raftadvertise", env = "CINDER_RAFT_ADVERTISE")]
    pub raft_advertise: Option<String>,

    /// Identifier of this node, unique in the cluster
    #[arg(long = "id", env = "CINDER_NODE_ID")]
    pub node_id: String,

    /// Client address of an existing member to join instead of bootstrapping
    #[arg(long = "join", env = "CINDER_JOIN")]
    pub join: Option<String>,

    /// How long a write waits for its commit
    #[arg(long = "write-timeout-ms", env = "CINDER_WRITE_TIMEOUT_MS", default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Applied entries between snapshots, 0 disables them
    #[arg(long = "snapshot-threshold", env = "CINDER_SNAPSHOT_THRESHOLD", default_value_t = 1024)]
    pub snapshot_threshold: u64,
}

impl Config {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Engine settings derived from the flags
    pub fn engine(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(self.node_id.clone(), self.raft_dir.clone(), self.raft_bind.clone());
        engine.advertise = self.raft_advertise.clone();
        engine.snapshot_threshold = self.snapshot_threshold;
        engine
    }
}
