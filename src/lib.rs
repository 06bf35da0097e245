// Core modules for the cinder replicated key-value store
pub mod protocol; // RESP parser + encoders + CommandName
pub mod command; // KeyValueCommand log entry codec
pub mod error; // Error taxonomy
pub mod fsm; // StateMachine (apply / get / snapshot / restore)
pub mod engine; // LogEngine boundary + raft-rs RaftEngine
pub mod coordinator; // Coordinator (leader-gated writes, membership)
pub mod session; // Session (per-connection command loop)
pub mod net; // bind_listener + accept loop + join client
pub mod config; // Config (clap flags)
pub mod server; // Node wiring (bootstrap or join, then serve)

// Re-export the public surface for easier access
pub use protocol::*;
pub use command::*;
pub use error::{Error, Result};
pub use fsm::*;
pub use engine::{CommitFuture, EngineConfig, EngineError, LogEngine, RaftEngine, Server};
pub use coordinator::*;
pub use session::*;
pub use config::Config;
pub use server::Node;

// Default client address
pub const DEFAULT_ADDR: &str = "0.0.0.0:7819";

// Default raft transport address
pub const DEFAULT_RAFT_ADDR: &str = "127.0.0.1:15379";
