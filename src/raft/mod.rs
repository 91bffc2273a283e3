mod applier;
mod config;
mod error;
mod log;
mod node;
mod replication;
mod rpc;
mod state;
mod timer;
mod transport;

pub use self::applier::{Applier, StateMachine};
pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::log::{EntryPayload, FileLogStore, LogEntry, LogStore, MemLogStore};
pub use self::node::{CommitSender, NodeStatus, Outbound, RaftNode};
pub use self::replication::{PeerProgress, ReplicationManager, ReplicationOutcome};
pub use self::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendMeta, RequestVoteRequest,
    RequestVoteResponse,
};
pub use self::state::{FileStateStore, HardState, MemStateStore, NodeRole, NodeState, StateStore};
pub use self::timer::{random_election_timeout, ElectionTimer, HeartbeatTimer};
pub use self::transport::{MemNetwork, MemTransport, Transport};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

const INBOX_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, RaftError>>;

/// Events funneled into a node's actor. Everything that touches node state
/// arrives here, including responses to RPCs the node sent itself.
#[derive(Debug)]
pub enum RaftMessage {
    RequestVote {
        request: RequestVoteRequest,
        reply: Reply<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: Reply<AppendEntriesResponse>,
    },
    RequestVoteResponseFromPeer {
        peer_id: String,
        term: u64,
        response: RequestVoteResponse,
    },
    AppendEntriesResponseFromPeer {
        peer_id: String,
        meta: AppendMeta,
        response: AppendEntriesResponse,
    },
    Submit {
        command: Vec<u8>,
        reply: Reply<u64>,
    },
    Status {
        reply: Reply<NodeStatus>,
    },
    Shutdown,
}

/// Handle to a running node. Cheap to clone; the node stops once
/// [`Raft::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct Raft {
    id: String,
    tx: mpsc::Sender<RaftMessage>,
}

impl Raft {
    /// Spawns the node actor and its applier on the current tokio runtime.
    pub fn start<T, S>(
        node: RaftNode,
        transport: Arc<T>,
        machine: S,
    ) -> (Self, JoinHandle<Result<(), RaftError>>)
    where
        T: Transport,
        S: StateMachine,
    {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        tokio::spawn(Applier::new(machine, apply_rx).run());

        let id = node.id().to_string();
        let driver = Driver {
            rpc_timeout: node.config().rpc_timeout(),
            node,
            transport,
            inbox: tx.downgrade(),
            apply_tx,
        };
        let handle = tokio::spawn(driver.run(rx));

        (Self { id, tx }, handle)
    }

    /// Opens file-backed stores under `config.data_dir` and starts the node.
    pub fn open<T, S>(
        config: RaftConfig,
        transport: Arc<T>,
        machine: S,
    ) -> Result<(Self, JoinHandle<Result<(), RaftError>>), RaftError>
    where
        T: Transport,
        S: StateMachine,
    {
        let log = FileLogStore::open(&config.data_dir)?;
        let state_store = FileStateStore::open(&config.data_dir)?;
        let node = RaftNode::new(config, Box::new(log), Box::new(state_store))?;
        Ok(Self::start(node, transport, machine))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(Reply<R>) -> RaftMessage,
    ) -> Result<R, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RaftError::NotRunning)?;
        rx.await.map_err(|_| RaftError::NotRunning)?
    }

    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.call(|reply| RaftMessage::RequestVote { request, reply })
            .await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|reply| RaftMessage::AppendEntries { request, reply })
            .await
    }

    /// Submits a command and waits until it is committed, returning its
    /// index. Fails with `NotLeader` on a non-leader and with
    /// `Indeterminate` if the entry is overwritten before it commits.
    pub async fn submit(&self, command: Vec<u8>) -> Result<u64, RaftError> {
        self.call(|reply| RaftMessage::Submit { command, reply })
            .await
    }

    pub async fn status(&self) -> Result<NodeStatus, RaftError> {
        self.call(|reply| RaftMessage::Status { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RaftMessage::Shutdown).await;
    }
}

/// Owns the node and serializes every mutation of it.
struct Driver<T: Transport> {
    node: RaftNode,
    transport: Arc<T>,
    // Weak so that the actor stops when all external handles are gone.
    inbox: mpsc::WeakSender<RaftMessage>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
    rpc_timeout: Duration,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<RaftMessage>) -> Result<(), RaftError> {
        info!("Node {} running", self.node.id());

        loop {
            let deadline = self.node.next_deadline();
            let epoch = self.node.election_epoch();

            let result = tokio::select! {
                message = rx.recv() => match message {
                    Some(RaftMessage::Shutdown) | None => break,
                    Some(message) => self.handle_message(message),
                },
                _ = sleep_until(deadline) => self.node.on_timer(epoch, Instant::now()),
            };

            if let Err(e) = result.and_then(|_| self.flush()) {
                if e.is_fatal() {
                    error!("Node {} halting: {e}", self.node.id());
                    return Err(e);
                }
                warn!("Node {}: {e}", self.node.id());
            }
        }

        info!("Node {} stopped", self.node.id());
        Ok(())
    }

    fn handle_message(&mut self, message: RaftMessage) -> Result<(), RaftError> {
        let now = Instant::now();
        match message {
            RaftMessage::RequestVote { request, reply } => {
                let result = self.node.handle_request_vote(request, now);
                respond(reply, result)
            }
            RaftMessage::AppendEntries { request, reply } => {
                let result = self.node.handle_append_entries(request, now);
                respond(reply, result)
            }
            RaftMessage::RequestVoteResponseFromPeer {
                peer_id,
                term,
                response,
            } => self
                .node
                .handle_vote_response(&peer_id, term, response, now),
            RaftMessage::AppendEntriesResponseFromPeer {
                peer_id,
                meta,
                response,
            } => self
                .node
                .handle_append_response(&peer_id, meta, response, now),
            RaftMessage::Submit { command, reply } => match self.node.submit(command) {
                Ok(index) => {
                    self.node.watch_commit(index, reply);
                    Ok(())
                }
                Err(e) => respond(reply, Err(e)),
            },
            RaftMessage::Status { reply } => {
                let _ = reply.send(Ok(self.node.status()));
                Ok(())
            }
            RaftMessage::Shutdown => Ok(()),
        }
    }

    /// Dispatches queued RPCs and hands newly committed entries to the applier.
    fn flush(&mut self) -> Result<(), RaftError> {
        for outbound in self.node.take_outbound() {
            self.dispatch(outbound);
        }
        for entry in self.node.take_committed()? {
            if self.apply_tx.send(entry).is_err() {
                warn!("Applier for node {} has stopped", self.node.id());
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&self, outbound: Outbound) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let rpc_timeout = self.rpc_timeout;

        tokio::spawn(async move {
            match outbound {
                Outbound::RequestVote { peer, request } => {
                    let term = request.term;
                    let result =
                        timeout(rpc_timeout, transport.send_request_vote(&peer, request)).await;
                    match result {
                        Ok(Ok(response)) => {
                            let message = RaftMessage::RequestVoteResponseFromPeer {
                                peer_id: peer.clone(),
                                term,
                                response,
                            };
                            if inbox.send(message).await.is_err() {
                                debug!("Dropping RequestVote response from {peer}: node stopped");
                            }
                        }
                        Ok(Err(e)) => debug!("Failed to send RequestVote to {peer}: {e}"),
                        Err(_) => debug!("{}", RaftError::NetworkTimeout(peer)),
                    }
                }
                Outbound::AppendEntries { peer, request } => {
                    let meta = AppendMeta::from(&request);
                    let result =
                        timeout(rpc_timeout, transport.send_append_entries(&peer, request)).await;
                    match result {
                        Ok(Ok(response)) => {
                            let message = RaftMessage::AppendEntriesResponseFromPeer {
                                peer_id: peer.clone(),
                                meta,
                                response,
                            };
                            if inbox.send(message).await.is_err() {
                                debug!("Dropping AppendEntries response from {peer}: node stopped");
                            }
                        }
                        Ok(Err(e)) => debug!("Failed to send AppendEntries to {peer}: {e}"),
                        Err(_) => debug!("{}", RaftError::NetworkTimeout(peer)),
                    }
                }
            }
        });
    }
}

/// Sends an RPC result back to the caller. A fatal error is reported to the
/// caller as `NotRunning` and returned so the actor halts.
fn respond<R>(reply: Reply<R>, result: Result<R, RaftError>) -> Result<(), RaftError> {
    match result {
        Ok(value) => {
            let _ = reply.send(Ok(value));
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(RaftError::NotRunning));
            Err(e)
        }
        Err(e) => {
            let _ = reply.send(Err(e));
            Ok(())
        }
    }
}
