/*!
 * Replicated State Machine
 *
 * The in-memory map every node converges on. The log engine feeds it
 * committed entries one at a time, in commit order, from a single thread;
 * client reads go straight to `get` and may lag the newest commit.
 */

use crate::command::{KeyValueCommand, Operation};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use slog::{debug, warn, Logger};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

// Same hasher the rest of the store uses for hot maps
type AHash = BuildHasherDefault<ahash::AHasher>;

type Map = HashMap<String, String, AHash>;

/// Deterministic key-value state machine
///
/// One mutex guards the map for both reads and mutations, so a reader never
/// observes a half-applied entry.
pub struct StateMachine {
    map: Mutex<Map>,
    logger: Logger,
}

impl StateMachine {
    pub fn new(logger: Logger) -> Self {
        Self {
            map: Mutex::new(Map::default()),
            logger,
        }
    }

    /// Apply one committed log entry
    ///
    /// Malformed or foreign entries are logged and reported back as the
    /// outcome; they leave the map untouched instead of taking the node down.
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        let cmd = match KeyValueCommand::decode(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(self.logger, "failed to decode log entry"; "error" => %e);
                return Err(e);
            }
        };

        match cmd.op {
            Operation::Set => {
                let value = cmd.value.unwrap_or_default();
                debug!(self.logger, "apply set"; "key" => &cmd.key, "value" => &value);
                self.map.lock().insert(cmd.key, value);
                Ok(())
            }
            Operation::Del => {
                debug!(self.logger, "apply del"; "key" => &cmd.key);
                // Deleting an absent key is fine
                self.map.lock().remove(&cmd.key);
                Ok(())
            }
            Operation::Unknown(tag) => {
                warn!(self.logger, "operation not supported"; "op" => &tag);
                Err(Error::UnsupportedOperation(tag))
            }
        }
    }

    /// Current value of `key`, `None` if the key is absent
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    /// One-shot export of the current state for snapshotting
    ///
    /// The map is copied under the lock and then walked lazily, in no
    /// particular order.
    pub fn snapshot(&self) -> impl Iterator<Item = (String, String)> {
        let copy = self.map.lock().clone();
        copy.into_iter()
    }

    /// Replace the whole map with the contents of a snapshot
    pub fn restore<I>(&self, items: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let fresh: Map = items.into_iter().collect();
        debug!(self.logger, "restored state machine"; "keys" => fresh.len());
        *self.map.lock() = fresh;
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
