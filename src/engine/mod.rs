//! Replicated-log engine.
//!
//! The store only talks to consensus through [`LogEngine`]. [`RaftEngine`]
//! is the production implementation on top of raft-rs; tests swap in
//! lightweight fakes.

pub mod node;
pub mod storage;
pub mod transport;

pub use node::{EngineConfig, RaftEngine};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// A cluster member as recorded in the replicated configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Operator-chosen node identifier
    pub id: String,
    /// Raft transport address of the node
    pub address: String,
}

impl Server {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    pub fn raft_id(&self) -> u64 {
        raft_id(&self.id)
    }
}

/// Numeric raft id for a string node id
///
/// raft-rs reserves 0 as "no node", so a zero hash is remapped.
pub fn raft_id(node_id: &str) -> u64 {
    match xxh3_64(node_id.as_bytes()) {
        0 => 1,
        id => id,
    }
}

/// Failures reported by the replicated-log engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("timed out waiting for commit")]
    Timeout,

    #[error("leadership lost before commit")]
    LeadershipLost,

    #[error("not leader")]
    NotLeader,

    #[error("log engine is shut down")]
    Shutdown,

    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,

    #[error("another membership change is still in progress")]
    ConfChangeInProgress,

    #[error("raft: {0}")]
    Raft(#[from] raft::Error),

    #[error("raft codec: {0}")]
    Codec(#[from] protobuf::ProtobufError),

    #[error("raft storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("raft snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

type Outcome = Result<(), EngineError>;

/// Pending result of a proposal or membership change
///
/// Resolves once the entry has been committed and applied on this node, or
/// fails with whatever the engine reports.
pub struct CommitFuture {
    rx: Receiver<Outcome>,
}

impl CommitFuture {
    /// Create a future together with the sender that completes it
    pub fn pending() -> (Sender<Outcome>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    /// A future that is already resolved
    pub fn ready(outcome: Outcome) -> Self {
        let (tx, fut) = Self::pending();
        // Capacity 1 and nothing queued yet
        let _ = tx.send(outcome);
        fut
    }

    /// Block until the outcome is known or `timeout` elapses
    ///
    /// Timing out does not withdraw the proposal; it may still commit.
    pub fn wait(self, timeout: Duration) -> Outcome {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Shutdown),
        }
    }
}

/// The replicated-log interface the coordinator consumes
pub trait LogEngine: Send + Sync {
    /// Whether this node currently believes it is the leader
    fn is_leader(&self) -> bool;

    /// Append `data` to the log
    fn propose(&self, data: Vec<u8>) -> CommitFuture;

    /// Current cluster membership, read fresh from the engine
    fn configuration(&self) -> Result<Vec<Server>, EngineError>;

    /// Add `id` as a voter reachable at `address`
    fn add_voter(&self, id: &str, address: &str) -> CommitFuture;

    /// Remove `id` from the cluster
    fn remove_server(&self, id: &str) -> CommitFuture;

    /// Seed a brand-new cluster with `server` as its only voter
    fn bootstrap(&self, server: Server) -> Result<(), EngineError>;
}
