use thiserror::Error;
use tonic::Status;

use crate::raft::RaftError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("gRPC error: {0}")]
    GrpcError(#[from] Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
}

impl From<NetworkError> for RaftError {
    fn from(err: NetworkError) -> Self {
        RaftError::NetworkError(err.to_string())
    }
}

/// Maps a consensus error onto the gRPC status reported to remote callers.
pub fn status_from_raft_error(err: RaftError) -> Status {
    match err {
        RaftError::NotLeader { .. } => Status::failed_precondition(err.to_string()),
        RaftError::NotRunning => Status::unavailable(err.to_string()),
        RaftError::Indeterminate { .. } => Status::aborted(err.to_string()),
        RaftError::InvalidLogIndex(_) => Status::invalid_argument(err.to_string()),
        other => Status::internal(format!("Internal error: {other}")),
    }
}
