/*!
 * Store Coordinator
 *
 * Sits between client sessions and the replicated log. Writes are gated on
 * local leadership and block until the log engine reports the commit (or
 * the write timeout runs out); reads are served from the local state
 * machine without touching the log. Membership requests are checked
 * against the engine's live configuration, never a cached copy.
 */

use crate::command::KeyValueCommand;
use crate::engine::{LogEngine, Server};
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use slog::{debug, info, Logger};
use std::sync::Arc;
use std::time::Duration;

/// How long a write waits for its commit by default
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Coordinator {
    engine: Arc<dyn LogEngine>,
    fsm: Arc<StateMachine>,
    write_timeout: Duration,
    logger: Logger,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn LogEngine>, fsm: Arc<StateMachine>, logger: Logger) -> Self {
        Self {
            engine,
            fsm,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            logger,
        }
    }

    /// Override the commit wait bound
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Replicate `key = value`
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        self.replicate(KeyValueCommand::set(key, value))
    }

    /// Replicate the removal of `key`
    pub fn delete(&self, key: &str) -> Result<()> {
        self.replicate(KeyValueCommand::del(key))
    }

    /// Local read; `None` when the key is absent
    pub fn read(&self, key: &str) -> Option<String> {
        self.fsm.get(key)
    }

    fn replicate(&self, cmd: KeyValueCommand) -> Result<()> {
        if !self.engine.is_leader() {
            return Err(Error::NotLeader);
        }
        let data = cmd.encode()?;
        self.engine.propose(data).wait(self.write_timeout)?;
        Ok(())
    }

    /// Add `node_id` as a voter reachable at `address`
    pub fn join(&self, node_id: &str, address: &str) -> Result<()> {
        info!(self.logger, "received join request"; "id" => node_id, "address" => address);

        let members = self.engine.configuration()?;
        if members.iter().any(|s| s.id == node_id) {
            return Err(Error::AlreadyJoined(node_id.to_string()));
        }

        self.engine
            .add_voter(node_id, address)
            .wait(self.write_timeout)?;
        info!(self.logger, "node joined"; "id" => node_id, "address" => address);
        Ok(())
    }

    /// Remove `node_id` from the cluster; unknown ids are a no-op
    pub fn leave(&self, node_id: &str) -> Result<()> {
        info!(self.logger, "received leave request"; "id" => node_id);

        let members = self.engine.configuration()?;
        if !members.iter().any(|s| s.id == node_id) {
            debug!(self.logger, "node not in cluster, nothing to remove"; "id" => node_id);
            return Ok(());
        }

        self.engine.remove_server(node_id).wait(self.write_timeout)?;
        info!(self.logger, "node left"; "id" => node_id);
        Ok(())
    }

    /// Seed a new single-member cluster with this node
    pub fn bootstrap(&self, node_id: &str, address: &str) -> Result<()> {
        self.engine.bootstrap(Server::new(node_id, address))?;
        Ok(())
    }
}
