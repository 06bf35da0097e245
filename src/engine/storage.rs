//! Raft log storage.
//!
//! The log lives in memory (a dummy entry at `offset` keeps index arithmetic
//! simple) and every mutation is mirrored into an append-only journal under
//! the engine directory. Snapshots are written next to it as whole files;
//! taking or installing one rewrites the journal so it only holds what the
//! snapshot does not cover.

use super::{EngineError, Server};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use protobuf::Message as _;
use raft::prelude::*;
use raft::{Error as RaftError, GetEntriesContext, RaftState, Result as RaftResult, Storage, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JOURNAL_FILE: &str = "raft.log";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".snap";

/// Snapshot files kept on disk
pub const SNAPSHOT_RETAIN: usize = 2;

const REC_ENTRY: u8 = 1;
const REC_HARD_STATE: u8 = 2;
const REC_CONF_STATE: u8 = 3;

/// Raft log storage shared between the engine loop and raft-rs
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<RwLock<Core>>,
    journal: Arc<Mutex<Journal>>,
    dir: PathBuf,
}

struct Core {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    entries: Vec<Entry>,
    /// Index of the first entry in `entries` (entries[0].index == offset).
    offset: u64,
}

impl Core {
    fn empty() -> Self {
        Self {
            hard_state: HardState::default(),
            conf_state: ConfState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
            offset: 0,
        }
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.offset)
    }

    fn append(&mut self, entries: &[Entry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let first_new = entries[0].index;
        if first_new <= self.offset {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if first_new > self.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }

        // Truncate any conflicting tail entries.
        let relative = (first_new - self.offset) as usize;
        self.entries.truncate(relative);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn install(&mut self, snapshot: Snapshot) {
        let meta = snapshot.get_metadata();
        self.conf_state = meta.get_conf_state().clone();
        self.offset = meta.index;
        if self.hard_state.commit < meta.index {
            self.hard_state.commit = meta.index;
        }
        if self.hard_state.term < meta.term {
            self.hard_state.term = meta.term;
        }
        self.entries.clear();

        // Keep a dummy entry so that first_index / last_index stay consistent.
        let mut dummy = Entry::default();
        dummy.index = meta.index;
        dummy.term = meta.term;
        self.entries.push(dummy);

        self.snapshot = snapshot;
    }
}

impl LogStore {
    /// Open (or create) the storage under `dir`, replaying snapshot and journal
    pub fn open(dir: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(dir)?;

        let mut core = Core::empty();
        if let Some(snapshot) = load_latest_snapshot(dir)? {
            core.install(snapshot);
        }

        let journal_path = dir.join(JOURNAL_FILE);
        for record in Journal::replay(&journal_path)? {
            match record {
                Record::Entry(e) => {
                    if e.index > core.offset {
                        core.append(&[e])?;
                    }
                }
                Record::HardState(hs) => core.hard_state = hs,
                Record::ConfState(cs) => core.conf_state = cs,
            }
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(core)),
            journal: Arc::new(Mutex::new(Journal::open(journal_path)?)),
            dir: dir.to_path_buf(),
        })
    }

    /// Whether this store already belongs to a cluster
    pub fn initialized(&self) -> bool {
        let core = self.inner.read();
        !core.conf_state.voters.is_empty() || core.last_index() > 0 || core.hard_state.term > 0
    }

    /// Seed a single-voter configuration
    ///
    /// The founding member is written as a committed AddNode entry at
    /// index 1, so nodes that join later learn its address from the log.
    pub fn bootstrap(&self, server: &Server) -> Result<(), EngineError> {
        let id = server.raft_id();

        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = id;
        cc.context = serde_json::to_vec(server)?.into();

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.index = 1;
        entry.term = 1;
        entry.data = cc.write_to_bytes()?.into();

        let mut cs = ConfState::default();
        cs.voters = vec![id];

        let mut hs = HardState::default();
        hs.term = 1;
        hs.commit = 1;

        self.set_conf_state(cs)?;
        self.append(&[entry])?;
        self.set_hard_state(hs)?;
        self.sync()
    }

    /// Append entries to the log, replacing any existing entries from the
    /// same index onward.
    pub fn append(&self, entries: &[Entry]) -> Result<(), EngineError> {
        let mut core = self.inner.write();
        core.append(entries)?;
        let mut journal = self.journal.lock();
        for e in entries {
            journal.write(REC_ENTRY, e)?;
        }
        Ok(())
    }

    /// Persist the hard state (term, vote, commit).
    pub fn set_hard_state(&self, hs: HardState) -> Result<(), EngineError> {
        let mut core = self.inner.write();
        self.journal.lock().write(REC_HARD_STATE, &hs)?;
        core.hard_state = hs;
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), EngineError> {
        let mut hs = self.inner.read().hard_state.clone();
        hs.commit = commit;
        self.set_hard_state(hs)
    }

    /// Persist the conf state (voter / learner membership).
    pub fn set_conf_state(&self, cs: ConfState) -> Result<(), EngineError> {
        let mut core = self.inner.write();
        self.journal.lock().write(REC_CONF_STATE, &cs)?;
        core.conf_state = cs;
        Ok(())
    }

    pub fn conf_state(&self) -> ConfState {
        self.inner.read().conf_state.clone()
    }

    /// Flush the journal to disk
    pub fn sync(&self) -> Result<(), EngineError> {
        self.journal.lock().sync()?;
        Ok(())
    }

    /// Latest snapshot, if one was taken or installed
    pub fn snapshot_data(&self) -> Option<Snapshot> {
        let core = self.inner.read();
        if core.snapshot.is_empty() {
            None
        } else {
            Some(core.snapshot.clone())
        }
    }

    /// Apply a snapshot received from the leader, replacing all local state.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<(), EngineError> {
        {
            let mut core = self.inner.write();
            if snapshot.get_metadata().index <= core.offset {
                return Err(RaftError::Store(StorageError::SnapshotOutOfDate).into());
            }
            core.install(snapshot.clone());
        }
        self.persist_snapshot(&snapshot)
    }

    /// Record a snapshot at `index` holding `data` and compact the log up to it.
    pub fn compact(&self, index: u64, data: Vec<u8>) -> Result<(), EngineError> {
        let snapshot = {
            let mut core = self.inner.write();
            if index <= core.offset {
                return Err(RaftError::Store(StorageError::Compacted).into());
            }
            if index > core.last_index() {
                return Err(RaftError::Store(StorageError::Unavailable).into());
            }

            let relative = (index - core.offset) as usize;
            let term = core.entries[relative].term;

            let mut snap = Snapshot::default();
            snap.mut_metadata().index = index;
            snap.mut_metadata().term = term;
            snap.mut_metadata().set_conf_state(core.conf_state.clone());
            snap.data = data.into();

            core.entries.drain(..relative);
            core.offset = index;
            core.snapshot = snap.clone();
            snap
        };
        self.persist_snapshot(&snapshot)
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
        write_snapshot_file(&self.dir, snapshot)?;

        let core = self.inner.read();
        self.journal
            .lock()
            .rewrite(&core.hard_state, &core.conf_state, &core.entries[1..])
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> RaftResult<RaftState> {
        let core = self.inner.read();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> RaftResult<Vec<Entry>> {
        let max_size = max_size.into();
        let core = self.inner.read();

        if low <= core.offset {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }

        let lo = (low - core.offset) as usize;
        let hi = (high - core.offset) as usize;

        let mut result = Vec::new();
        let mut total_size: u64 = 0;

        for entry in &core.entries[lo..hi] {
            total_size += entry.compute_size() as u64;
            if let Some(max) = max_size {
                if !result.is_empty() && total_size > max {
                    break;
                }
            }
            result.push(entry.clone());
        }

        Ok(result)
    }

    fn term(&self, idx: u64) -> RaftResult<u64> {
        let core = self.inner.read();

        if idx < core.offset {
            return Err(RaftError::Store(StorageError::Compacted));
        }

        let relative = (idx - core.offset) as usize;
        match core.entries.get(relative) {
            Some(e) => Ok(e.term),
            None => Err(RaftError::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> RaftResult<u64> {
        Ok(self.inner.read().offset + 1)
    }

    fn last_index(&self) -> RaftResult<u64> {
        Ok(self.inner.read().last_index())
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> RaftResult<Snapshot> {
        let core = self.inner.read();
        if core.snapshot.is_empty() {
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(core.snapshot.clone())
    }
}

enum Record {
    Entry(Entry),
    HardState(HardState),
    ConfState(ConfState),
}

/// Append-only record file: `kind: u8 | len: u32 | protobuf payload`
struct Journal {
    path: PathBuf,
    file: BufWriter<File>,
}

impl Journal {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    fn write<M: protobuf::Message>(&mut self, kind: u8, msg: &M) -> Result<(), EngineError> {
        let payload = msg.write_to_bytes()?;
        self.file.write_all(&frame(kind, &payload))?;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()
    }

    /// Replace the journal with a compact image of the current state
    fn rewrite(&mut self, hs: &HardState, cs: &ConfState, entries: &[Entry]) -> Result<(), EngineError> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&frame(REC_CONF_STATE, &cs.write_to_bytes()?))?;
            for e in entries {
                out.write_all(&frame(REC_ENTRY, &e.write_to_bytes()?))?;
            }
            out.write_all(&frame(REC_HARD_STATE, &hs.write_to_bytes()?))?;
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        *self = Journal::open(self.path.clone())?;
        Ok(())
    }

    fn replay(path: &Path) -> Result<Vec<Record>, EngineError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut buf = &data[..];
        while buf.remaining() >= 5 {
            let kind = buf.get_u8();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                // Torn write at the tail; everything before it is intact.
                break;
            }
            let payload = &buf[..len];
            let record = match kind {
                REC_ENTRY => Record::Entry(Entry::parse_from_bytes(payload)?),
                REC_HARD_STATE => Record::HardState(HardState::parse_from_bytes(payload)?),
                REC_CONF_STATE => Record::ConfState(ConfState::parse_from_bytes(payload)?),
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown journal record kind {}", other),
                    )
                    .into())
                }
            };
            records.push(record);
            buf.advance(len);
        }
        Ok(records)
    }
}

fn frame(kind: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(kind);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

fn snapshot_index(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?
        .parse()
        .ok()
}

/// Snapshot files in `dir`, newest first
fn list_snapshots(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(snapshot_index) {
            found.push((index, entry.path()));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found)
}

fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>, EngineError> {
    match list_snapshots(dir)?.first() {
        Some((_, path)) => Ok(Some(Snapshot::parse_from_bytes(&fs::read(path)?)?)),
        None => Ok(None),
    }
}

fn write_snapshot_file(dir: &Path, snapshot: &Snapshot) -> Result<(), EngineError> {
    let index = snapshot.get_metadata().index;
    let name = format!("{}{:020}{}", SNAPSHOT_PREFIX, index, SNAPSHOT_SUFFIX);
    let path = dir.join(&name);
    let tmp = dir.join(format!("{}.tmp", name));

    let mut f = File::create(&tmp)?;
    f.write_all(&snapshot.write_to_bytes()?)?;
    f.sync_data()?;
    fs::rename(&tmp, &path)?;

    for (_, stale) in list_snapshots(dir)?.into_iter().skip(SNAPSHOT_RETAIN) {
        fs::remove_file(stale)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::raft_id;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cinder-storage-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn journal_replays_entries_and_state() {
        let dir = temp_dir("replay");
        {
            let store = LogStore::open(&dir).unwrap();
            assert!(!store.initialized());
            store.bootstrap(&Server::new("n1", "127.0.0.1:1")).unwrap();
            store.append(&[entry(2, 1, b"a"), entry(3, 1, b"b")]).unwrap();
            // Conflicting suffix from a newer term replaces index 3
            store.append(&[entry(3, 2, b"c")]).unwrap();
            store.set_commit(3).unwrap();
            store.sync().unwrap();
        }

        let store = LogStore::open(&dir).unwrap();
        assert!(store.initialized());
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.term(3).unwrap(), 2);
        let state = store.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 3);
        assert_eq!(state.conf_state.voters, vec![raft_id("n1")]);

        let ents = store.entries(2, 4, u64::MAX, GetEntriesContext::empty(false)).unwrap();
        assert_eq!(&ents[1].data[..], b"c");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn compaction_writes_snapshot_and_survives_reopen() {
        let dir = temp_dir("compact");
        {
            let store = LogStore::open(&dir).unwrap();
            store.bootstrap(&Server::new("n1", "127.0.0.1:1")).unwrap();
            store
                .append(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            store.set_commit(4).unwrap();
            store.compact(3, b"state".to_vec()).unwrap();
            assert_eq!(store.first_index().unwrap(), 4);
            assert!(matches!(
                store.entries(2, 4, u64::MAX, GetEntriesContext::empty(false)),
                Err(RaftError::Store(StorageError::Compacted))
            ));
            store.sync().unwrap();
        }

        let store = LogStore::open(&dir).unwrap();
        assert_eq!(store.first_index().unwrap(), 4);
        assert_eq!(store.last_index().unwrap(), 4);
        assert_eq!(store.term(3).unwrap(), 1);
        let snap = store.snapshot_data().unwrap();
        assert_eq!(snap.get_metadata().index, 3);
        assert_eq!(&snap.data[..], b"state");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_newest_snapshots_are_retained() {
        let dir = temp_dir("retain");
        let store = LogStore::open(&dir).unwrap();
        store.bootstrap(&Server::new("n1", "127.0.0.1:1")).unwrap();
        let ents: Vec<Entry> = (2..=5).map(|i| entry(i, 1, b"x")).collect();
        store.append(&ents).unwrap();
        for i in 2..=5 {
            store.compact(i, Vec::new()).unwrap();
        }
        let kept: Vec<u64> = list_snapshots(&dir).unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(kept, vec![5, 4]);
        let _ = fs::remove_dir_all(&dir);
    }
}
