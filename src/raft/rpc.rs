use serde::{Deserialize, Serialize};

use super::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request would leave in the follower's log.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the highest index known to match the leader's log.
    pub match_index: u64,
    /// On a log mismatch, the term of the follower's conflicting entry
    /// (`None` when its log is simply too short).
    pub conflict_term: Option<u64>,
    /// On a log mismatch, the first index the leader should retry from.
    pub conflict_index: u64,
}

impl AppendEntriesResponse {
    pub fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            match_index: 0,
            conflict_term: None,
            conflict_index: 0,
        }
    }
}

/// What the leader remembers about an in-flight AppendEntries so that the
/// response can be matched against the peer's current progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendMeta {
    pub term: u64,
    pub prev_log_index: u64,
    pub entries_len: u64,
}

impl From<&AppendEntriesRequest> for AppendMeta {
    fn from(req: &AppendEntriesRequest) -> Self {
        Self {
            term: req.term,
            prev_log_index: req.prev_log_index,
            entries_len: req.entries.len() as u64,
        }
    }
}
