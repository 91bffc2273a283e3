use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::network::proto;
use crate::network::proto::client_service_client::ClientServiceClient;
use crate::network::proto::raft_service_client::RaftServiceClient;
use crate::network::proto::{StatusRequest, StatusResponse, SubmitRequest, SubmitResponse};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftError, RequestVoteRequest,
    RequestVoteResponse, Transport,
};

use super::NetworkError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

async fn connect_channel(address: &str) -> Result<Channel, NetworkError> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))
        .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

    let channel = endpoint
        .connect_timeout(CONNECT_TIMEOUT)
        .connect()
        .await?;
    Ok(channel)
}

/// Lazily connected client for one peer's `RaftService`.
#[derive(Clone)]
pub struct RaftClient {
    address: String,
    client: Option<RaftServiceClient<Channel>>,
}

impl RaftClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        let channel = connect_channel(&self.address).await?;
        self.client = Some(RaftServiceClient::new(channel));
        Ok(())
    }

    async fn connected(&mut self) -> Result<&mut RaftServiceClient<Channel>, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }
        self.client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))
    }

    pub async fn request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NetworkError> {
        let request: proto::RequestVoteRequest = request.into();
        let response = self
            .connected()
            .await?
            .request_vote(Request::new(request))
            .await?
            .into_inner();
        Ok(response.into())
    }

    pub async fn append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NetworkError> {
        let request: proto::AppendEntriesRequest = request.into();
        let response = self
            .connected()
            .await?
            .append_entries(Request::new(request))
            .await?
            .into_inner();
        Ok(response.into())
    }
}

/// [`Transport`] over gRPC. Keeps one client per peer and drops it after a
/// failure so that the next call reconnects.
pub struct GrpcTransport {
    clients: Mutex<HashMap<String, RaftClient>>,
}

impl GrpcTransport {
    pub fn new(peers: &HashMap<String, String>) -> Self {
        let clients = peers
            .iter()
            .map(|(id, address)| (id.clone(), RaftClient::new(address)))
            .collect();
        Self {
            clients: Mutex::new(clients),
        }
    }

    fn client(&self, peer: &str) -> Result<RaftClient, NetworkError> {
        let clients = self
            .clients
            .lock()
            .map_err(|_| NetworkError::ConnectionError("client table poisoned".to_string()))?;
        clients
            .get(peer)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))
    }

    fn store(&self, peer: &str, client: RaftClient) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(peer.to_string(), client);
        }
    }

    fn forget(&self, peer: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(client) = clients.get_mut(peer) {
                client.client = None;
            }
        }
    }

    fn settle<R>(
        &self,
        peer: &str,
        was_connected: bool,
        client: RaftClient,
        result: Result<R, NetworkError>,
    ) -> Result<R, RaftError> {
        match result {
            Ok(response) => {
                if !was_connected {
                    self.store(peer, client);
                }
                Ok(response)
            }
            Err(e) => {
                debug!("RPC to {peer} failed, dropping connection: {e}");
                self.forget(peer);
                Err(e.into())
            }
        }
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        let mut client = self.client(peer)?;
        let was_connected = client.is_connected();
        let result = client.request_vote(request).await;
        self.settle(peer, was_connected, client, result)
    }

    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let mut client = self.client(peer)?;
        let was_connected = client.is_connected();
        let result = client.append_entries(request).await;
        self.settle(peer, was_connected, client, result)
    }
}

/// Client for the `ClientService` of a cluster member.
pub struct ClusterClient {
    address: String,
    client: Option<ClientServiceClient<Channel>>,
}

impl ClusterClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            client: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        let channel = connect_channel(&self.address).await?;
        self.client = Some(ClientServiceClient::new(channel));
        Ok(())
    }

    async fn connected(&mut self) -> Result<&mut ClientServiceClient<Channel>, NetworkError> {
        if self.client.is_none() {
            self.connect().await?;
        }
        self.client
            .as_mut()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))
    }

    pub async fn submit(&mut self, command: Vec<u8>) -> Result<SubmitResponse, NetworkError> {
        let response = self
            .connected()
            .await?
            .submit(Request::new(SubmitRequest { command }))
            .await?
            .into_inner();
        Ok(response)
    }

    /// Submits, following leader redirects up to `max_redirects` times.
    pub async fn submit_to_leader(
        &mut self,
        command: Vec<u8>,
        max_redirects: usize,
    ) -> Result<SubmitResponse, NetworkError> {
        let mut response = self.submit(command.clone()).await?;
        for _ in 0..max_redirects {
            if !response.not_leader || response.leader_address.is_empty() {
                break;
            }
            debug!(
                "{} is not the leader, redirecting to {}",
                self.address, response.leader_address
            );
            *self = ClusterClient::new(&response.leader_address);
            response = self.submit(command.clone()).await?;
        }
        Ok(response)
    }

    pub async fn status(&mut self) -> Result<StatusResponse, NetworkError> {
        let response = self
            .connected()
            .await?
            .status(Request::new(StatusRequest {}))
            .await?
            .into_inner();
        Ok(response)
    }
}
