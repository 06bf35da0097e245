/*!
 * Node Wiring
 *
 * Brings one cluster member up: state machine, raft engine, coordinator,
 * then either bootstraps a fresh cluster or asks an existing member to add
 * this node, and finally binds the client listener.
 */

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::engine::{EngineError, RaftEngine};
use crate::error::Error;
use crate::fsm::StateMachine;
use crate::net::{bind_listener, send_join, serve};
use anyhow::*;
use slog::{info, o, warn, Logger};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;

/// A started node whose client listener is bound but not yet serving
pub struct Node {
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
    logger: Logger,
}

impl Node {
    /// Open the engine, join or bootstrap, and bind the client port
    ///
    /// Only engine initialization is fatal. A failed join is logged and the
    /// node comes up anyway, so an operator can retry it by hand.
    pub fn start(config: &Config, logger: Logger) -> Result<Self> {
        let fsm = Arc::new(StateMachine::new(logger.new(o!("component" => "fsm"))));
        let engine = RaftEngine::open(config.engine(), fsm.clone(), logger.new(o!("component" => "raft")))
            .context("failed to open raft engine")?;
        let raft_addr = engine.advertise().to_string();

        let coordinator = Arc::new(
            Coordinator::new(Arc::new(engine), fsm, logger.new(o!("component" => "store")))
                .with_write_timeout(config.write_timeout()),
        );

        match &config.join {
            None => match coordinator.bootstrap(&config.node_id, &raft_addr) {
                std::result::Result::Ok(()) => {}
                Err(Error::Engine(EngineError::AlreadyBootstrapped)) => {
                    info!(logger, "raft state found on disk, skipping bootstrap");
                }
                Err(e) => return Err(e).context("failed to bootstrap cluster"),
            },
            Some(peer) => {
                if let Err(e) = send_join(peer, &raft_addr, &config.node_id) {
                    warn!(logger, "failed to join cluster"; "peer" => peer, "error" => %e);
                }
            }
        }

        let addr: SocketAddr = config
            .server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("cannot resolve {}", config.server))?;
        let listener = bind_listener(addr, false).with_context(|| format!("failed to bind {}", addr))?;

        Ok(Self {
            coordinator,
            listener,
            logger,
        })
    }

    /// Address the client listener actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Accept clients until the process exits
    pub fn serve(self) -> Result<()> {
        serve(self.listener, self.coordinator, self.logger)
    }
}

/// Start a node from `config` and serve clients on the calling thread
pub fn run(config: &Config, logger: Logger) -> Result<()> {
    let node = Node::start(config, logger.clone())?;
    info!(logger, "cinder node running"; "id" => &config.node_id, "addr" => %node.local_addr()?);
    node.serve()
}
