use log::debug;
use std::collections::HashMap;
use tonic::{Request, Response, Status};

use crate::network::proto::client_service_server::ClientService;
use crate::network::proto::raft_service_server::RaftService;
use crate::raft::{Raft, RaftError};

use super::error::status_from_raft_error;
use super::proto::*;

/// Serves peer RPCs by forwarding them into the node actor.
pub struct RaftServer {
    raft: Raft,
}

impl RaftServer {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn request_vote(
        &self,
        request: Request<RequestVoteRequest>,
    ) -> Result<Response<RequestVoteResponse>, Status> {
        let req = request.into_inner();
        debug!("Received RequestVote: {:?}", req);

        let response = self
            .raft
            .request_vote(req.into())
            .await
            .map_err(status_from_raft_error)?;
        Ok(Response::new(response.into()))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        debug!(
            "Received AppendEntries: term={}, leader={}, entries={}",
            req.term,
            req.leader_id,
            req.entries.len()
        );

        let response = self
            .raft
            .append_entries(req.into())
            .await
            .map_err(status_from_raft_error)?;
        Ok(Response::new(response.into()))
    }
}

/// Client-facing submission and status service.
pub struct ClientServer {
    raft: Raft,
    // node_id -> address, for leader redirects
    peers: HashMap<String, String>,
}

impl ClientServer {
    pub fn new(raft: Raft, peers: HashMap<String, String>) -> Self {
        Self { raft, peers }
    }

    fn leader_address(&self, leader_hint: Option<String>) -> String {
        leader_hint
            .and_then(|id| self.peers.get(&id).cloned())
            .unwrap_or_default()
    }
}

#[tonic::async_trait]
impl ClientService for ClientServer {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let req = request.into_inner();

        let response = match self.raft.submit(req.command).await {
            Ok(index) => SubmitResponse {
                success: true,
                index,
                ..Default::default()
            },
            Err(RaftError::NotLeader { leader_hint }) => SubmitResponse {
                error: "Not the leader".to_string(),
                leader_address: self.leader_address(leader_hint),
                not_leader: true,
                ..Default::default()
            },
            Err(e @ RaftError::Indeterminate { .. }) => SubmitResponse {
                error: e.to_string(),
                ..Default::default()
            },
            Err(e) => return Err(status_from_raft_error(e)),
        };
        Ok(Response::new(response))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let status = self.raft.status().await.map_err(status_from_raft_error)?;
        Ok(Response::new(status.into()))
    }
}
