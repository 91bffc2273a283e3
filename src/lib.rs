// Consensus core
pub mod raft;

// gRPC transport and services
pub mod network;

// Binary support
pub mod config;
pub mod kv;

// Public exports
pub use config::{NodeConfig, PeerConfig};
pub use kv::{KvCommand, KvStore};
pub use raft::{Raft, RaftConfig, RaftError, StateMachine};
