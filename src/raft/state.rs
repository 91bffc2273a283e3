use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::RaftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// The part of the node state that must survive restarts.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: NodeRole,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
}

impl NodeState {
    pub fn from_hard_state(hard: HardState) -> Self {
        Self {
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }
}

/// Durable record of `(current_term, voted_for)`.
///
/// `persist` must not return before the state is on stable storage: replies
/// that reveal the term or a granted vote are only sent after it succeeds.
pub trait StateStore: Send {
    fn persist(&mut self, state: &HardState) -> Result<(), RaftError>;
    fn load(&mut self) -> Result<HardState, RaftError>;
}

/// Stores the hard state in `<data_dir>/raft/state.bin`, replacing it
/// atomically through a fsynced temporary file.
pub struct FileStateStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStateStore {
    pub fn open(data_dir: &str) -> Result<Self, RaftError> {
        let dir = PathBuf::from(data_dir).join("raft");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("state.bin"),
            tmp_path: dir.join("state.bin.tmp"),
        })
    }
}

impl StateStore for FileStateStore {
    fn persist(&mut self, state: &HardState) -> Result<(), RaftError> {
        let encoded = bincode::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&self.tmp_path, &self.path)?;
            if let Some(dir) = self.path.parent() {
                File::open(dir)?.sync_all()?;
            }
            Ok(())
        };
        write().map_err(|e| RaftError::Persistence(format!("writing hard state: {e}")))
    }

    fn load(&mut self) -> Result<HardState, RaftError> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }
        let mut buffer = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buffer)?;
        let (state, _): (HardState, usize) =
            bincode::decode_from_slice(&buffer, bincode::config::standard())
                .map_err(|e| RaftError::SerializationError(e.to_string()))?;
        Ok(state)
    }
}

/// In-memory state store. Clones share the same backing cell, so a test can
/// keep a handle to inspect what the node persisted or to make it fail.
#[derive(Debug, Clone, Default)]
pub struct MemStateStore {
    inner: Arc<Mutex<MemStateInner>>,
}

#[derive(Debug, Default)]
struct MemStateInner {
    state: HardState,
    fail: bool,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `persist` fail.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail = fail;
        }
    }

    pub fn snapshot(&self) -> HardState {
        self.inner
            .lock()
            .map(|inner| inner.state.clone())
            .unwrap_or_default()
    }
}

impl StateStore for MemStateStore {
    fn persist(&mut self, state: &HardState) -> Result<(), RaftError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| RaftError::Persistence("state store lock poisoned".to_string()))?;
        if inner.fail {
            return Err(RaftError::Persistence("injected write failure".to_string()));
        }
        inner.state = state.clone();
        Ok(())
    }

    fn load(&mut self) -> Result<HardState, RaftError> {
        self.inner
            .lock()
            .map(|inner| inner.state.clone())
            .map_err(|_| RaftError::Persistence("state store lock poisoned".to_string()))
    }
}
