/*!
 * Error Taxonomy
 *
 * Every failure the store can surface to a client. Session-level errors
 * (params, unknown commands) never leave the session; coordinator-level
 * errors travel up unchanged and are rendered as RESP error replies.
 */

use crate::engine::EngineError;

/// Errors produced by the codec, state machine, coordinator and sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong number of arguments, or an argument that is not UTF-8
    #[error("params invalid for '{0}' command")]
    Param(&'static str),

    /// Unknown wire command name
    #[error("command not supported")]
    UnsupportedCommand,

    /// A committed log entry carried an operation tag we don't know
    #[error("operation not supported: '{0}'")]
    UnsupportedOperation(String),

    /// Write attempted on a node that does not believe itself leader
    #[error("not leader")]
    NotLeader,

    /// Join requested for a node that is already a voter
    #[error("node {0} already joined raft cluster")]
    AlreadyJoined(String),

    /// Malformed log entry (or, in practice never, an unencodable command)
    #[error("log entry codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Anything reported by the replicated-log engine, passed through as-is
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
