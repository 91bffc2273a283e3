use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    AppendEntriesRequest, AppendEntriesResponse, Raft, RaftError, RequestVoteRequest,
    RequestVoteResponse,
};

/// Carries consensus RPCs to peers. Delivery is at most once per call; the
/// caller bounds each call with its own timeout and treats a failure as "no
/// answer", never as a rejection.
#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError>;

    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError>;
}

/// In-process network connecting [`Raft`] handles directly, with partition
/// control. Nodes assigned to different groups cannot reach each other;
/// nodes without a group form one implicit group.
#[derive(Default)]
pub struct MemNetwork {
    nodes: RwLock<HashMap<String, Raft>>,
    groups: RwLock<HashMap<String, usize>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<MemTransport> {
        Arc::new(MemTransport {
            from: from.to_string(),
            net: Arc::clone(self),
        })
    }

    pub fn register(&self, raft: Raft) {
        write(&self.nodes).insert(raft.id().to_string(), raft);
    }

    /// Detaches a node, as if its process had died.
    pub fn remove(&self, id: &str) -> Option<Raft> {
        write(&self.nodes).remove(id)
    }

    pub fn node(&self, id: &str) -> Option<Raft> {
        read(&self.nodes).get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<Raft> {
        let mut nodes: Vec<Raft> = read(&self.nodes).values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Splits the cluster; each slice is a group that can only talk to itself.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut map = write(&self.groups);
        map.clear();
        for (group, members) in groups.iter().enumerate() {
            for id in *members {
                map.insert(id.to_string(), group + 1);
            }
        }
    }

    /// Cuts one node off from everyone else.
    pub fn isolate(&self, id: &str) {
        let mut map = write(&self.groups);
        let group = map.values().copied().max().unwrap_or(0) + 1;
        map.insert(id.to_string(), group);
    }

    pub fn heal(&self) {
        write(&self.groups).clear();
    }

    pub fn reachable(&self, from: &str, to: &str) -> bool {
        let map = read(&self.groups);
        map.get(from) == map.get(to)
    }

    fn route(&self, from: &str, to: &str) -> Result<Raft, RaftError> {
        if !self.reachable(from, to) {
            return Err(RaftError::NetworkError(format!("{to} unreachable from {from}")));
        }
        self.node(to)
            .ok_or_else(|| RaftError::NetworkError(format!("Unknown peer: {to}")))
    }
}

pub struct MemTransport {
    from: String,
    net: Arc<MemNetwork>,
}

#[tonic::async_trait]
impl Transport for MemTransport {
    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        let raft = self.net.route(&self.from, peer)?;
        let response = raft.request_vote(request).await?;
        // Partitions also swallow replies.
        self.net.route(peer, &self.from)?;
        Ok(response)
    }

    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let raft = self.net.route(&self.from, peer)?;
        let response = raft.append_entries(request).await?;
        self.net.route(peer, &self.from)?;
        Ok(response)
    }
}
