//! raft-rs backed [`LogEngine`].
//!
//! One `raft-engine` thread owns the `RawNode`. It multiplexes client
//! requests, inbound peer messages and the tick timer, persists each
//! `Ready`, and is the only caller of [`StateMachine::apply`], so committed
//! entries reach the state machine strictly in order.

use super::storage::LogStore;
use super::transport::Transport;
use super::{raft_id, CommitFuture, EngineError, LogEngine, Server};
use crate::fsm::StateMachine;
use crossbeam::channel::{select, tick, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use protobuf::Message as _;
use raft::prelude::*;
use raft::{RawNode, StateRole};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine tuning and placement
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local node identifier
    pub node_id: String,
    /// Directory for the journal and snapshot files
    pub dir: PathBuf,
    /// Address the raft transport binds
    pub bind: String,
    /// Address peers should dial; defaults to the bound address
    pub advertise: Option<String>,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    /// Applied entries between snapshots (0 disables snapshots)
    pub snapshot_threshold: u64,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<String>, dir: impl Into<PathBuf>, bind: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            dir: dir.into(),
            bind: bind.into(),
            advertise: None,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_threshold: 1024,
        }
    }
}

type Reply = Sender<Result<(), EngineError>>;

enum Request {
    Propose { data: Vec<u8>, reply: Reply },
    AddVoter { server: Server, reply: Reply },
    RemoveServer { id: String, reply: Reply },
    Bootstrap { server: Server, reply: Reply },
}

/// State the engine thread publishes for lock-free-ish reads
struct Shared {
    leader: AtomicBool,
    members: RwLock<BTreeMap<u64, Server>>,
}

/// Snapshot payload: the key-value state plus the membership table
#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    members: Vec<Server>,
    data: BTreeMap<String, String>,
}

/// Handle to the raft engine thread
pub struct RaftEngine {
    requests: Sender<Request>,
    shared: Arc<Shared>,
    transport: Arc<Transport>,
}

impl RaftEngine {
    /// Open storage under `config.dir`, start the transport and the engine loop
    ///
    /// A store that already holds a snapshot restores `fsm` and the
    /// membership table from it before any log entry is replayed.
    pub fn open(config: EngineConfig, fsm: Arc<StateMachine>, logger: Logger) -> Result<Self, EngineError> {
        let id = raft_id(&config.node_id);
        let logger = logger.new(o!("node" => config.node_id.clone()));
        let store = LogStore::open(&config.dir)?;

        let shared = Arc::new(Shared {
            leader: AtomicBool::new(false),
            members: RwLock::new(BTreeMap::new()),
        });

        let mut applied = 0;
        if let Some(snapshot) = store.snapshot_data() {
            let image: SnapshotImage = serde_json::from_slice(&snapshot.data)?;
            fsm.restore(image.data);
            *shared.members.write() = image.members.into_iter().map(|s| (s.raft_id(), s)).collect();
            applied = snapshot.get_metadata().index;
            info!(logger, "restored snapshot"; "index" => applied);
        }

        let (msg_tx, msg_rx) = unbounded::<Message>();
        let (transport, _) = Transport::start(id, &config.bind, config.advertise.clone(), msg_tx, logger.clone())?;
        for server in shared.members.read().values() {
            transport.add_peer(server.raft_id(), &server.address);
        }

        let raft_config = Config {
            id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            applied,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        raft_config.validate()?;
        let node = RawNode::new(&raft_config, store.clone(), &logger)?;

        let (req_tx, req_rx) = unbounded::<Request>();
        let mut worker = Worker {
            id,
            node,
            raft_config,
            store,
            fsm,
            shared: shared.clone(),
            transport: transport.clone(),
            pending: FxHashMap::default(),
            next_seq: 0,
            applied,
            last_snapshot: applied,
            snapshot_threshold: config.snapshot_threshold,
            conf_changed: false,
            logger,
        };

        let tick_interval = config.tick_interval;
        std::thread::Builder::new()
            .name("raft-engine".into())
            .spawn(move || worker.run(req_rx, msg_rx, tick_interval))?;

        Ok(Self {
            requests: req_tx,
            shared,
            transport,
        })
    }

    /// Raft address this node advertises to peers
    pub fn advertise(&self) -> &str {
        self.transport.advertise()
    }

    fn submit(&self, build: impl FnOnce(Reply) -> Request) -> CommitFuture {
        let (tx, fut) = CommitFuture::pending();
        if self.requests.send(build(tx)).is_err() {
            return CommitFuture::ready(Err(EngineError::Shutdown));
        }
        fut
    }
}

impl LogEngine for RaftEngine {
    fn is_leader(&self) -> bool {
        self.shared.leader.load(Ordering::Acquire)
    }

    fn propose(&self, data: Vec<u8>) -> CommitFuture {
        self.submit(|reply| Request::Propose { data, reply })
    }

    fn configuration(&self) -> Result<Vec<Server>, EngineError> {
        Ok(self.shared.members.read().values().cloned().collect())
    }

    fn add_voter(&self, id: &str, address: &str) -> CommitFuture {
        let server = Server::new(id, address);
        self.submit(|reply| Request::AddVoter { server, reply })
    }

    fn remove_server(&self, id: &str) -> CommitFuture {
        let id = id.to_string();
        self.submit(|reply| Request::RemoveServer { id, reply })
    }

    fn bootstrap(&self, server: Server) -> Result<(), EngineError> {
        self.submit(|reply| Request::Bootstrap { server, reply })
            .wait(Duration::from_secs(10))
    }
}

/// The engine loop's private state
struct Worker {
    id: u64,
    node: RawNode<LogStore>,
    raft_config: Config,
    store: LogStore,
    fsm: Arc<StateMachine>,
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    /// Proposals from this node waiting to be applied, by sequence number
    pending: FxHashMap<u64, Reply>,
    next_seq: u64,
    applied: u64,
    last_snapshot: u64,
    snapshot_threshold: u64,
    /// A membership change was applied since the last snapshot
    conf_changed: bool,
    logger: Logger,
}

impl Worker {
    fn run(&mut self, requests: Receiver<Request>, messages: Receiver<Message>, interval: Duration) {
        let ticker = tick(interval);
        loop {
            select! {
                recv(requests) -> req => match req {
                    Ok(req) => self.handle(req),
                    Err(_) => break,
                },
                recv(messages) -> msg => match msg {
                    Ok(msg) => {
                        if let Err(e) = self.node.step(msg) {
                            debug!(self.logger, "raft step error"; "error" => %e);
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    self.node.tick();
                }
            }

            if let Err(e) = self.on_ready() {
                error!(self.logger, "failed to process raft ready"; "error" => %e);
            }
            self.publish_role();
        }
        info!(self.logger, "raft engine stopped");
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Propose { data, reply } => {
                if !self.is_leader() {
                    let _ = reply.send(Err(EngineError::NotLeader));
                    return;
                }
                let (seq, ctx) = self.next_context();
                match self.node.propose(ctx, data) {
                    Ok(()) => {
                        self.pending.insert(seq, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Request::AddVoter { server, reply } => {
                let mut cc = ConfChange::default();
                cc.set_change_type(ConfChangeType::AddNode);
                cc.node_id = server.raft_id();
                self.propose_conf_change(cc, &server, reply);
            }
            Request::RemoveServer { id, reply } => {
                let node_id = raft_id(&id);
                let server = self
                    .shared
                    .members
                    .read()
                    .get(&node_id)
                    .cloned()
                    .unwrap_or_else(|| Server::new(id, ""));
                let mut cc = ConfChange::default();
                cc.set_change_type(ConfChangeType::RemoveNode);
                cc.node_id = node_id;
                self.propose_conf_change(cc, &server, reply);
            }
            Request::Bootstrap { server, reply } => {
                let _ = reply.send(self.bootstrap(server));
            }
        }
    }

    /// Propose a single membership change
    ///
    /// raft-rs turns a conf change proposed while another is unapplied into
    /// an empty entry, dropping our context, so the caller would only ever
    /// see a timeout. Such requests are refused up front instead.
    fn propose_conf_change(&mut self, mut cc: ConfChange, server: &Server, reply: Reply) {
        if !self.is_leader() {
            let _ = reply.send(Err(EngineError::NotLeader));
            return;
        }
        if self.node.raft.has_pending_conf() {
            let _ = reply.send(Err(EngineError::ConfChangeInProgress));
            return;
        }
        match serde_json::to_vec(server) {
            Ok(context) => cc.context = context.into(),
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        }
        let (seq, ctx) = self.next_context();
        match self.node.propose_conf_change(ctx, cc) {
            Ok(()) => {
                self.pending.insert(seq, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn bootstrap(&mut self, server: Server) -> Result<(), EngineError> {
        if self.store.initialized() {
            return Err(EngineError::AlreadyBootstrapped);
        }
        self.store.bootstrap(&server)?;

        // The node was built over an empty store; rebuild it over the seeded one.
        self.node = RawNode::new(&self.raft_config, self.store.clone(), &self.logger)?;
        self.node.campaign()?;
        info!(self.logger, "bootstrapped cluster"; "id" => &server.id, "address" => &server.address);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.node.raft.state == StateRole::Leader
    }

    /// Proposal context: our raft id followed by a per-node sequence number
    fn next_context(&mut self) -> (u64, Vec<u8>) {
        self.next_seq += 1;
        let mut ctx = Vec::with_capacity(16);
        ctx.extend_from_slice(&self.id.to_be_bytes());
        ctx.extend_from_slice(&self.next_seq.to_be_bytes());
        (self.next_seq, ctx)
    }

    fn publish_role(&mut self) {
        let leader = self.is_leader();
        let was = self.shared.leader.swap(leader, Ordering::AcqRel);
        if leader && !was {
            info!(self.logger, "became leader"; "term" => self.node.raft.term);
        } else if was && !leader {
            info!(self.logger, "stepped down"; "term" => self.node.raft.term, "leader" => self.node.raft.leader_id);
            for (_, reply) in self.pending.drain() {
                let _ = reply.send(Err(EngineError::LeadershipLost));
            }
        }
    }

    fn on_ready(&mut self) -> Result<(), EngineError> {
        if !self.node.has_ready() {
            return Ok(());
        }

        let mut ready = self.node.ready();

        // 1. Messages that may go out before persistence.
        self.send(ready.take_messages());

        // 2. Snapshot from the leader.
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot)?;
        }

        // 3. Apply committed entries.
        self.apply_committed(ready.take_committed_entries())?;

        // 4. Persist entries and hard state.
        if !ready.entries().is_empty() {
            self.store.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.store.set_hard_state(hs.clone())?;
        }
        self.store.sync()?;

        // 5. Messages that had to wait for persistence (votes etc).
        self.send(ready.take_persisted_messages());

        // 6. Advance and drain the light ready.
        let mut light = self.node.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.store.set_commit(commit)?;
        }
        self.send(light.take_messages());
        self.apply_committed(light.take_committed_entries())?;
        self.node.advance_apply();

        self.maybe_snapshot()
    }

    fn send(&self, msgs: Vec<Message>) {
        for msg in msgs {
            self.transport.send(msg);
        }
    }

    fn apply_committed(&mut self, entries: Vec<Entry>) -> Result<(), EngineError> {
        for entry in entries {
            if !entry.data.is_empty() {
                match entry.get_entry_type() {
                    EntryType::EntryNormal => {
                        // Failures are logged by the state machine and leave it untouched
                        let _ = self.fsm.apply(&entry.data);
                    }
                    EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                    EntryType::EntryConfChangeV2 => {
                        warn!(self.logger, "ignoring joint configuration change"; "index" => entry.index);
                    }
                }
            }
            self.applied = entry.index;
            self.resolve(&entry.context);
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<(), EngineError> {
        let cc = ConfChange::parse_from_bytes(&entry.data)?;
        let cs = self.node.apply_conf_change(&cc)?;
        self.store.set_conf_state(cs)?;

        self.conf_changed = true;

        let server: Server = serde_json::from_slice(&cc.context)?;
        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                info!(self.logger, "member added"; "id" => &server.id, "address" => &server.address);
                self.transport.add_peer(cc.node_id, &server.address);
                self.shared.members.write().insert(cc.node_id, server);
            }
            ConfChangeType::RemoveNode => {
                info!(self.logger, "member removed"; "id" => &server.id);
                self.transport.remove_peer(cc.node_id);
                self.shared.members.write().remove(&cc.node_id);
            }
        }
        Ok(())
    }

    /// Complete the local proposal behind `context`, if it is ours
    fn resolve(&mut self, context: &[u8]) {
        if context.len() != 16 || context[..8] != self.id.to_be_bytes() {
            return;
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&context[8..]);
        if let Some(reply) = self.pending.remove(&u64::from_be_bytes(seq)) {
            let _ = reply.send(Ok(()));
        }
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        let index = snapshot.get_metadata().index;
        let image: SnapshotImage = serde_json::from_slice(&snapshot.data)?;

        self.fsm.restore(image.data);
        let members: BTreeMap<u64, Server> = image.members.into_iter().map(|s| (s.raft_id(), s)).collect();
        for (id, server) in &members {
            self.transport.add_peer(*id, &server.address);
        }
        *self.shared.members.write() = members;

        self.store.apply_snapshot(snapshot)?;
        self.applied = index;
        self.last_snapshot = index;
        info!(self.logger, "installed snapshot from leader"; "index" => index);
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), EngineError> {
        // Once the log is compacted, a new member can only catch up from a
        // snapshot whose conf state already lists it; raft-rs refuses others.
        let membership_moved = std::mem::take(&mut self.conf_changed) && self.last_snapshot > 0;

        if self.snapshot_threshold == 0 || self.applied <= self.last_snapshot {
            return Ok(());
        }
        if !membership_moved && self.applied < self.last_snapshot + self.snapshot_threshold {
            return Ok(());
        }

        let image = SnapshotImage {
            members: self.shared.members.read().values().cloned().collect(),
            data: self.fsm.snapshot().collect(),
        };
        let data = serde_json::to_vec(&image)?;
        self.store.compact(self.applied, data)?;
        self.last_snapshot = self.applied;
        debug!(self.logger, "took snapshot"; "index" => self.applied, "keys" => image.data.len());
        Ok(())
    }
}
