pub mod client;
pub mod error;
pub mod server;

pub mod proto {
    tonic::include_proto!("raft");
}

pub use client::{ClusterClient, GrpcTransport, RaftClient};
pub use error::NetworkError;
pub use server::{ClientServer, RaftServer};

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, EntryPayload, LogEntry, NodeStatus,
    RequestVoteRequest, RequestVoteResponse,
};

// Conversions between the wire types and the consensus types. Term 0 never
// labels a real entry, so it doubles as "no conflict term" on the wire.

impl From<LogEntry> for proto::LogEntry {
    fn from(entry: LogEntry) -> Self {
        let (noop, command) = match entry.payload {
            EntryPayload::Noop => (true, Vec::new()),
            EntryPayload::Command(command) => (false, command),
        };
        Self {
            index: entry.index,
            term: entry.term,
            noop,
            command,
        }
    }
}

impl From<proto::LogEntry> for LogEntry {
    fn from(entry: proto::LogEntry) -> Self {
        if entry.noop {
            LogEntry::noop(entry.index, entry.term)
        } else {
            LogEntry::command(entry.index, entry.term, entry.command)
        }
    }
}

impl From<RequestVoteRequest> for proto::RequestVoteRequest {
    fn from(req: RequestVoteRequest) -> Self {
        Self {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<proto::RequestVoteRequest> for RequestVoteRequest {
    fn from(req: proto::RequestVoteRequest) -> Self {
        Self {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<RequestVoteResponse> for proto::RequestVoteResponse {
    fn from(resp: RequestVoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<proto::RequestVoteResponse> for RequestVoteResponse {
    fn from(resp: proto::RequestVoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<AppendEntriesRequest> for proto::AppendEntriesRequest {
    fn from(req: AppendEntriesRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<proto::AppendEntriesRequest> for AppendEntriesRequest {
    fn from(req: proto::AppendEntriesRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<AppendEntriesResponse> for proto::AppendEntriesResponse {
    fn from(resp: AppendEntriesResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            match_index: resp.match_index,
            conflict_term: resp.conflict_term.unwrap_or(0),
            conflict_index: resp.conflict_index,
        }
    }
}

impl From<proto::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(resp: proto::AppendEntriesResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            match_index: resp.match_index,
            conflict_term: (resp.conflict_term != 0).then_some(resp.conflict_term),
            conflict_index: resp.conflict_index,
        }
    }
}

impl From<NodeStatus> for proto::StatusResponse {
    fn from(status: NodeStatus) -> Self {
        Self {
            node_id: status.id,
            role: status.role.to_string(),
            term: status.term,
            leader_id: status.leader_id.unwrap_or_default(),
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            last_log_index: status.last_log_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_and_command_entries_survive_the_wire() {
        let noop: proto::LogEntry = LogEntry::noop(3, 2).into();
        assert!(noop.noop);
        assert_eq!(LogEntry::from(noop), LogEntry::noop(3, 2));

        let cmd = LogEntry::command(4, 2, b"set".to_vec());
        assert_eq!(LogEntry::from(proto::LogEntry::from(cmd.clone())), cmd);
    }

    #[test]
    fn missing_conflict_term_is_encoded_as_zero() {
        let resp = AppendEntriesResponse {
            term: 5,
            success: false,
            match_index: 0,
            conflict_term: None,
            conflict_index: 7,
        };
        let wire = proto::AppendEntriesResponse::from(resp.clone());
        assert_eq!(wire.conflict_term, 0);
        assert_eq!(AppendEntriesResponse::from(wire), resp);

        let wire = proto::AppendEntriesResponse {
            conflict_term: 3,
            ..Default::default()
        };
        assert_eq!(AppendEntriesResponse::from(wire).conflict_term, Some(3));
    }
}
