use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RaftError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub node_id: String,
    pub data_dir: String,
    pub peers: HashMap<String, String>, // node_id -> address
    pub election_timeout_min: u64,      // in milliseconds
    pub election_timeout_max: u64,      // in milliseconds
    pub heartbeat_interval: u64,        // in milliseconds
    pub rpc_timeout: u64,               // in milliseconds, per RPC
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::new("node1", "data")
    }
}

impl RaftConfig {
    pub fn new(node_id: &str, data_dir: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            data_dir: data_dir.to_string(),
            peers: HashMap::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_append_entries: 64,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, address: &str) {
        self.peers.insert(peer_id.to_string(), address.to_string());
    }

    /// Peer ids in a stable order.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Strict majority of the whole cluster, self included.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.is_empty() {
            return Err(RaftError::Config("node_id must not be empty".to_string()));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::Config(format!(
                "peer list must not contain the local node {}",
                self.node_id
            )));
        }
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 || self.rpc_timeout == 0 {
            return Err(RaftError::Config("timeouts must be non-zero".to_string()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Config(
                "max_append_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
