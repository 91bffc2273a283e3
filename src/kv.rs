use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::raft::StateMachine;

/// Commands understood by [`KvStore`], carried as JSON in log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: &str, value: &str) -> Self {
        KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn delete(key: &str) -> Self {
        KvCommand::Delete {
            key: key.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a plain enum of strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Default)]
struct KvState {
    data: BTreeMap<String, String>,
    applied_index: u64,
}

/// In-memory key-value state machine. Clones share the same map, so one copy
/// can be handed to the node while another is used for reads.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    state: Arc<Mutex<KvState>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_applied(&self) -> u64 {
        self.lock().applied_index
    }
}

impl StateMachine for KvStore {
    /// Returns the JSON encoding of the key's previous value (`null` if it
    /// had none). Malformed commands are skipped and yield an empty result.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8> {
        let mut state = self.lock();
        state.applied_index = index;

        let previous = match KvCommand::decode(command) {
            Ok(KvCommand::Set { key, value }) => state.data.insert(key, value),
            Ok(KvCommand::Delete { key }) => state.data.remove(&key),
            Err(e) => {
                warn!("Skipping malformed command at index {index}: {e}");
                return Vec::new();
            }
        };
        serde_json::to_vec(&previous).unwrap_or_default()
    }

    fn applied_index(&self) -> u64 {
        self.last_applied()
    }
}
