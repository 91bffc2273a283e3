use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader (last known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    #[error("Node is not running")]
    NotRunning,

    #[error("Stale term {received} (current term {current})")]
    StaleTerm { received: u64, current: u64 },

    #[error("Log mismatch at index {index}")]
    LogMismatch { index: u64 },

    #[error("Entry at index {index} was overwritten before commit; outcome is indeterminate")]
    Indeterminate { index: u64 },

    #[error("Refusing to overwrite committed entry at index {0}")]
    CommittedEntryConflict(u64),

    #[error("Invalid log index: {0}")]
    InvalidLogIndex(u64),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Network timeout contacting {0}")]
    NetworkTimeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RaftError {
    /// Errors after which the node must stop voting and acknowledging.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Persistence(_) | RaftError::CommittedEntryConflict(_)
        )
    }
}
