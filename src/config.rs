use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::raft::{RaftConfig, RaftError};

/// On-disk configuration of a cluster member, read by the `node` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub address: String,
    pub data_dir: String,
    pub peers: Vec<PeerConfig>,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// Optional overrides of the consensus timing, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub rpc_timeout: Option<u64>,
    pub max_append_entries: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            address: "127.0.0.1:8000".to_string(),
            data_dir: "data".to_string(),
            peers: vec![],
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| RaftError::Config(format!("{}: {e}", path.display())))
    }

    /// Per-node directory holding the consensus files.
    pub fn node_data_dir(&self) -> String {
        format!("{}/{}", self.data_dir, self.node_id)
    }

    /// Builds the consensus configuration, skipping any peer entry that names
    /// this node so that a shared cluster file can be used on every member.
    pub fn raft_config(&self) -> Result<RaftConfig, RaftError> {
        let mut config = RaftConfig::new(&self.node_id, &self.node_data_dir());
        for peer in &self.peers {
            if peer.id != self.node_id {
                config.add_peer(&peer.id, &peer.address);
            }
        }

        let timing = &self.timing;
        if let Some(ms) = timing.election_timeout_min {
            config.election_timeout_min = ms;
        }
        if let Some(ms) = timing.election_timeout_max {
            config.election_timeout_max = ms;
        }
        if let Some(ms) = timing.heartbeat_interval {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = timing.rpc_timeout {
            config.rpc_timeout = ms;
        }
        if let Some(n) = timing.max_append_entries {
            config.max_append_entries = n;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses `id=address` pairs separated by commas.
pub fn parse_peers(list: &str) -> Result<Vec<PeerConfig>, RaftError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((id, address)) if !id.is_empty() && !address.is_empty() => Ok(PeerConfig {
                id: id.to_string(),
                address: address.to_string(),
            }),
            _ => Err(RaftError::Config(format!(
                "invalid peer '{pair}', expected id=address"
            ))),
        })
        .collect()
}
