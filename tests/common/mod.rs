#![allow(dead_code)]

use cinder::*;
use parking_lot::Mutex;
use slog::{o, Discard, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn logger() -> Logger {
    Logger::root(Discard, o!())
}

/// In-process stand-in for the raft engine
///
/// Proposals are applied to the state machine immediately, as if a single
/// node committed them. `fail_with` makes the next operations fail with a
/// chosen engine error instead.
pub struct FakeEngine {
    pub leader: AtomicBool,
    pub members: Mutex<Vec<Server>>,
    pub proposals: Mutex<Vec<Vec<u8>>>,
    pub fail: Mutex<Option<fn() -> EngineError>>,
    fsm: Arc<StateMachine>,
}

impl FakeEngine {
    pub fn new(fsm: Arc<StateMachine>, leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
            members: Mutex::new(Vec::new()),
            proposals: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            fsm,
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn fail_with(&self, f: fn() -> EngineError) {
        *self.fail.lock() = Some(f);
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.lock().iter().map(|s| s.id.clone()).collect()
    }

    fn failure(&self) -> Option<EngineError> {
        self.fail.lock().map(|f| f())
    }
}

impl LogEngine for FakeEngine {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn propose(&self, data: Vec<u8>) -> CommitFuture {
        if let Some(e) = self.failure() {
            return CommitFuture::ready(Err(e));
        }
        let _ = self.fsm.apply(&data);
        self.proposals.lock().push(data);
        CommitFuture::ready(Ok(()))
    }

    fn configuration(&self) -> Result<Vec<Server>, EngineError> {
        Ok(self.members.lock().clone())
    }

    fn add_voter(&self, id: &str, address: &str) -> CommitFuture {
        if let Some(e) = self.failure() {
            return CommitFuture::ready(Err(e));
        }
        self.members.lock().push(Server::new(id, address));
        CommitFuture::ready(Ok(()))
    }

    fn remove_server(&self, id: &str) -> CommitFuture {
        if let Some(e) = self.failure() {
            return CommitFuture::ready(Err(e));
        }
        self.members.lock().retain(|s| s.id != id);
        CommitFuture::ready(Ok(()))
    }

    fn bootstrap(&self, server: Server) -> Result<(), EngineError> {
        let mut members = self.members.lock();
        if !members.is_empty() {
            return Err(EngineError::AlreadyBootstrapped);
        }
        members.push(server);
        Ok(())
    }
}

/// Coordinator over a fake engine, plus handles to poke at both
pub fn coordinator(leader: bool) -> (Arc<Coordinator>, Arc<FakeEngine>, Arc<StateMachine>) {
    let fsm = Arc::new(StateMachine::new(logger()));
    let engine = Arc::new(FakeEngine::new(fsm.clone(), leader));
    let coordinator = Arc::new(Coordinator::new(engine.clone(), fsm.clone(), logger()));
    (coordinator, engine, fsm)
}
