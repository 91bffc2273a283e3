use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use raftcore::config::parse_peers;
use raftcore::network::proto::client_service_server::ClientServiceServer;
use raftcore::network::proto::raft_service_server::RaftServiceServer;
use raftcore::network::{ClientServer, ClusterClient, GrpcTransport, RaftServer};
use raftcore::{KvCommand, KvStore, NodeConfig, Raft};

const MAX_REDIRECTS: usize = 3;

#[derive(Parser)]
#[command(name = "raftcore")]
#[command(about = "A Raft-style replicated log consensus core built from scratch in Rust")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a cluster member
    Node {
        /// JSON node configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<String>,

        /// Unique ID for this node
        #[arg(short, long)]
        id: Option<String>,

        /// Directory to store data
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Address to listen on
        #[arg(short, long)]
        address: Option<String>,

        /// Comma-separated list of peers (id=address)
        #[arg(short, long)]
        peers: Option<String>,

        /// Clean the node's data directory before starting
        #[arg(long)]
        clean: bool,
    },

    /// Submit a key-value command, following leader redirects
    Submit {
        /// Address of any cluster member
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        address: String,

        #[command(subcommand)]
        op: KvOp,
    },

    /// Print a node's status
    Status {
        /// Address of the node
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        address: String,
    },
}

#[derive(Subcommand)]
enum KvOp {
    /// Set a key
    Set { key: String, value: String },
    /// Delete a key
    Delete { key: String },
}

impl From<KvOp> for KvCommand {
    fn from(op: KvOp) -> Self {
        match op {
            KvOp::Set { key, value } => KvCommand::Set { key, value },
            KvOp::Delete { key } => KvCommand::Delete { key },
        }
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn node_config(
    config: Option<String>,
    id: Option<String>,
    data_dir: Option<String>,
    address: Option<String>,
    peers: Option<String>,
) -> anyhow::Result<NodeConfig> {
    let mut cfg = match config {
        Some(path) => NodeConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => NodeConfig::default(),
    };
    if let Some(id) = id {
        cfg.node_id = id;
    }
    if let Some(data_dir) = data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(address) = address {
        cfg.address = address;
    }
    if let Some(peers) = peers {
        cfg.peers = parse_peers(&peers)?;
    }
    Ok(cfg)
}

async fn run_node(cfg: NodeConfig, clean: bool) -> anyhow::Result<()> {
    info!("Starting node {} at {}", cfg.node_id, cfg.address);

    let node_data_dir = cfg.node_data_dir();
    if clean && Path::new(&node_data_dir).exists() {
        info!("--clean flag detected, removing data directory: {node_data_dir}");
        std::fs::remove_dir_all(&node_data_dir)?;
    }
    std::fs::create_dir_all(&node_data_dir)?;

    let raft_config = cfg.raft_config()?;
    for (peer_id, peer_addr) in &raft_config.peers {
        info!("Added peer: {peer_id} at {peer_addr}");
    }

    let transport = Arc::new(GrpcTransport::new(&raft_config.peers));
    let peers = raft_config.peers.clone();
    let (raft, handle) = Raft::open(raft_config, transport, KvStore::new())?;

    let addr: SocketAddr = cfg
        .address
        .parse()
        .with_context(|| format!("bad address {}", cfg.address))?;
    let raft_server = RaftServer::new(raft.clone());
    let client_server = ClientServer::new(raft.clone(), peers);

    info!("gRPC server listening on {addr}");
    let served = tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(raft_server))
        .add_service(ClientServiceServer::new(client_server))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await;

    raft.shutdown().await;
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Node halted: {e}"),
        Err(e) => error!("Node task failed: {e}"),
    }
    served?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            config,
            id,
            data_dir,
            address,
            peers,
            clean,
        } => {
            let cfg = node_config(config, id, data_dir, address, peers)?;
            run_node(cfg, clean).await?;
        }
        Command::Submit { address, op } => {
            let command = KvCommand::from(op).encode();
            let mut client = ClusterClient::new(&address);
            let response = client.submit_to_leader(command, MAX_REDIRECTS).await?;
            if !response.success {
                bail!("submit failed: {}", response.error);
            }
            println!("committed at index {} (via {})", response.index, client.address());
        }
        Command::Status { address } => {
            let mut client = ClusterClient::new(&address);
            let status = client.status().await?;
            let leader = if status.leader_id.is_empty() {
                "unknown"
            } else {
                status.leader_id.as_str()
            };
            println!("node:         {}", status.node_id);
            println!("role:         {}", status.role);
            println!("term:         {}", status.term);
            println!("leader:       {leader}");
            println!("commit index: {}", status.commit_index);
            println!("last applied: {}", status.last_applied);
            println!("last log:     {}", status.last_log_index);
        }
    }

    Ok(())
}
