use std::collections::{BTreeMap, HashSet};
use tokio::sync::oneshot;
use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

use super::{
    AppendEntriesRequest, AppendEntriesResponse, AppendMeta, ElectionTimer, HeartbeatTimer,
    LogEntry, LogStore, NodeRole, NodeState, PeerProgress, RaftConfig, RaftError,
    ReplicationManager, ReplicationOutcome, RequestVoteRequest, RequestVoteResponse, StateStore,
};

/// Resolves with the committed index of a submitted command.
pub type CommitSender = oneshot::Sender<Result<u64, RaftError>>;

struct PendingCommand {
    term: u64,
    tx: CommitSender,
}

/// An RPC the node wants sent. The node never performs I/O itself; the
/// owner drains these with [`RaftNode::take_outbound`] and feeds responses
/// back in.
#[derive(Debug, Clone)]
pub enum Outbound {
    RequestVote {
        peer: String,
        request: RequestVoteRequest,
    },
    AppendEntries {
        peer: String,
        request: AppendEntriesRequest,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: String,
    pub role: NodeRole,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// Consensus state machine for one cluster member.
///
/// Every method runs to completion without blocking on the network, and
/// anything that reveals the term or a vote is persisted before the method
/// returns. The node must be driven by a single owner.
pub struct RaftNode {
    // Node identity
    id: String,
    config: RaftConfig,
    peers: Vec<String>,

    // Raft state
    state: NodeState,
    log: Box<dyn LogStore>,
    state_store: Box<dyn StateStore>,

    // Election state
    election_timer: ElectionTimer,
    votes_received: HashSet<String>,

    // Leader state
    replication: ReplicationManager,
    heartbeat: HeartbeatTimer,

    // Submitted commands waiting for commit, by log index.
    pending: BTreeMap<u64, PendingCommand>,
    outbox: Vec<Outbound>,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        log: Box<dyn LogStore>,
        mut state_store: Box<dyn StateStore>,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let hard_state = state_store.load()?;

        info!(
            "Node {} starting at term {} with {} log entries",
            config.node_id,
            hard_state.current_term,
            log.last_index()
        );

        Ok(Self {
            id: config.node_id.clone(),
            peers: config.peer_ids(),
            state: NodeState::from_hard_state(hard_state),
            log,
            state_store,
            election_timer: ElectionTimer::new(
                config.election_timeout_min,
                config.election_timeout_max,
            ),
            votes_received: HashSet::new(),
            replication: ReplicationManager::new(config.max_append_entries),
            heartbeat: HeartbeatTimer::new(config.heartbeat()),
            pending: BTreeMap::new(),
            outbox: Vec::new(),
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn role(&self) -> NodeRole {
        self.state.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.role, NodeRole::Leader)
    }

    pub fn peer_progress(&self, peer: &str) -> Option<PeerProgress> {
        self.replication.progress(peer)
    }

    pub fn election_epoch(&self) -> u64 {
        self.election_timer.epoch()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.state.role,
            term: self.state.current_term,
            leader_id: self.state.leader_id.clone(),
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    /// When the node next needs [`RaftNode::on_timer`]: the heartbeat while
    /// leading, the election deadline otherwise.
    pub fn next_deadline(&self) -> Instant {
        match self.state.role {
            NodeRole::Leader => self
                .heartbeat
                .next()
                .unwrap_or_else(|| Instant::now() + self.config.heartbeat()),
            NodeRole::Follower | NodeRole::Candidate => self.election_timer.deadline(),
        }
    }

    /// Timer callback. `epoch` is the election epoch observed when the timer
    /// was armed; a timeout from an earlier epoch is dropped.
    pub fn on_timer(&mut self, epoch: u64, now: Instant) -> Result<(), RaftError> {
        match self.state.role {
            NodeRole::Leader => {
                if self.heartbeat.poll(now) {
                    self.broadcast_append_entries()?;
                }
            }
            NodeRole::Follower | NodeRole::Candidate => {
                if !self.election_timer.is_current(epoch) {
                    debug!("Ignoring stale election timeout (epoch {epoch})");
                    return Ok(());
                }
                if self.election_timer.expired(now) {
                    info!(
                        "Node {} election timeout elapsed in term {}",
                        self.id, self.state.current_term
                    );
                    self.start_election(now)?;
                }
            }
        }
        Ok(())
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Committed entries not yet handed to the applier, in index order.
    pub fn take_committed(&mut self) -> Result<Vec<LogEntry>, RaftError> {
        if self.state.last_applied >= self.state.commit_index {
            return Ok(Vec::new());
        }
        let entries = self
            .log
            .read_range(self.state.last_applied + 1, self.state.commit_index + 1)?;
        self.state.last_applied = self.state.commit_index;
        Ok(entries)
    }

    fn persist(&mut self) -> Result<(), RaftError> {
        let hard_state = self.state.hard_state();
        self.state_store.persist(&hard_state).map_err(|e| {
            error!("Node {} failed to persist term/vote: {e}", self.id);
            match e {
                RaftError::Persistence(_) => e,
                other => RaftError::Persistence(other.to_string()),
            }
        })
    }

    /// Adopts a higher term seen in any RPC or response and steps down.
    fn observe_term(&mut self, term: u64, now: Instant) -> Result<(), RaftError> {
        if term <= self.state.current_term {
            return Ok(());
        }
        info!(
            "Node {} observed term {} (was {}), reverting to follower",
            self.id, term, self.state.current_term
        );
        self.state.current_term = term;
        self.state.voted_for = None;
        self.state.leader_id = None;
        self.persist()?;
        self.step_down(now);
        Ok(())
    }

    fn step_down(&mut self, now: Instant) {
        let previous = self.state.role;
        if previous == NodeRole::Follower {
            return;
        }
        self.state.role = NodeRole::Follower;
        self.votes_received.clear();
        self.replication.clear();
        self.heartbeat.stop();
        if previous == NodeRole::Leader {
            // The election deadline went stale while leading.
            self.election_timer.reset(now);
        }
        debug!("Node {} stepped down from {previous}", self.id);
    }

    pub fn start_election(&mut self, now: Instant) -> Result<(), RaftError> {
        self.state.current_term += 1;
        self.state.role = NodeRole::Candidate;
        self.state.voted_for = Some(self.id.clone());
        self.state.leader_id = None;
        self.persist()?;

        self.election_timer.reset(now);
        self.heartbeat.stop();
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        info!(
            "Node {} starting election for term {}",
            self.id, self.state.current_term
        );

        if self.votes_received.len() >= self.config.quorum() {
            info!(
                "Election won (single node), becoming leader for term {}",
                self.state.current_term
            );
            return self.become_leader(now);
        }

        let request = RequestVoteRequest {
            term: self.state.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in &self.peers {
            self.outbox.push(Outbound::RequestVote {
                peer: peer.clone(),
                request: request.clone(),
            });
        }
        Ok(())
    }

    pub fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
        now: Instant,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.observe_term(request.term, now)?;

        let can_vote = match &self.state.voted_for {
            None => true,
            Some(id) => *id == request.candidate_id,
        };
        // Lexicographic (last term, last index) comparison.
        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (self.log.last_term(), self.log.last_index());

        let vote_granted = request.term == self.state.current_term && can_vote && up_to_date;
        if vote_granted {
            self.state.voted_for = Some(request.candidate_id.clone());
            self.persist()?;
            self.election_timer.reset(now);
        }

        debug!(
            "Node {} {} vote for {} in term {}",
            self.id,
            if vote_granted { "granted" } else { "refused" },
            request.candidate_id,
            request.term
        );

        Ok(RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        })
    }

    pub fn handle_vote_response(
        &mut self,
        peer: &str,
        request_term: u64,
        response: RequestVoteResponse,
        now: Instant,
    ) -> Result<(), RaftError> {
        if response.term > self.state.current_term {
            return self.observe_term(response.term, now);
        }

        if self.state.role != NodeRole::Candidate
            || request_term != self.state.current_term
            || response.term != self.state.current_term
        {
            debug!("Node {} ignoring stale vote response from {peer}", self.id);
            return Ok(());
        }

        if response.vote_granted {
            self.votes_received.insert(peer.to_string());
            if self.votes_received.len() >= self.config.quorum() {
                info!(
                    "Node {} won election for term {} with {} votes",
                    self.id,
                    self.state.current_term,
                    self.votes_received.len()
                );
                self.become_leader(now)?;
            }
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant) -> Result<(), RaftError> {
        if self.state.role != NodeRole::Candidate {
            return Ok(());
        }

        info!(
            "Node {} becoming leader for term {}",
            self.id, self.state.current_term
        );

        self.state.role = NodeRole::Leader;
        self.state.leader_id = Some(self.id.clone());
        self.votes_received.clear();
        self.replication.reset(&self.peers, self.log.last_index());

        // A current-term entry lets earlier-term entries commit with it.
        let noop = LogEntry::noop(self.log.last_index() + 1, self.state.current_term);
        self.log.append(&[noop])?;

        self.heartbeat.start(now);
        self.advance_commit_index()?;
        self.broadcast_append_entries()
    }

    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
        now: Instant,
    ) -> Result<AppendEntriesResponse, RaftError> {
        if request.term < self.state.current_term {
            let stale = RaftError::StaleTerm {
                received: request.term,
                current: self.state.current_term,
            };
            debug!(
                "Node {} rejecting AppendEntries from {}: {stale}",
                self.id, request.leader_id
            );
            return Ok(AppendEntriesResponse::rejected(self.state.current_term));
        }

        self.observe_term(request.term, now)?;
        if self.state.role == NodeRole::Leader {
            warn!(
                "Node {} saw another leader {} in its own term {}",
                self.id, request.leader_id, request.term
            );
        }
        self.step_down(now);
        self.state.leader_id = Some(request.leader_id.clone());
        self.election_timer.reset(now);

        for (i, entry) in request.entries.iter().enumerate() {
            if entry.index != request.prev_log_index + 1 + i as u64 {
                return Err(RaftError::InvalidLogIndex(entry.index));
            }
        }

        let last_index = self.log.last_index();
        if request.prev_log_index > last_index {
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: 0,
                conflict_term: None,
                conflict_index: last_index + 1,
            });
        }

        let local_prev_term = self.log.term_at(request.prev_log_index).unwrap_or(0);
        if local_prev_term != request.prev_log_term {
            let conflict_index = self.first_index_of_term(local_prev_term, request.prev_log_index);
            let mismatch = RaftError::LogMismatch {
                index: request.prev_log_index,
            };
            debug!(
                "Node {} {mismatch}: have term {}, leader has {}",
                self.id, local_prev_term, request.prev_log_term
            );
            return Ok(AppendEntriesResponse {
                term: self.state.current_term,
                success: false,
                match_index: 0,
                conflict_term: Some(local_prev_term),
                conflict_index,
            });
        }

        for (offset, entry) in request.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.state.commit_index {
                        error!(
                            "Node {} asked to overwrite committed entry {}",
                            self.id, entry.index
                        );
                        return Err(RaftError::CommittedEntryConflict(entry.index));
                    }
                    debug!("Node {} truncating log from {}", self.id, entry.index);
                    self.log.truncate_from(entry.index)?;
                    self.fail_pending_from(entry.index);
                    self.log.append(&request.entries[offset..])?;
                    break;
                }
                None => {
                    self.log.append(&request.entries[offset..])?;
                    break;
                }
            }
        }

        let last_new_index = request.last_index();
        if request.leader_commit > self.state.commit_index {
            let commit = request.leader_commit.min(last_new_index);
            if commit > self.state.commit_index {
                self.state.commit_index = commit;
                self.resolve_pending();
            }
        }

        Ok(AppendEntriesResponse {
            term: self.state.current_term,
            success: true,
            match_index: last_new_index,
            conflict_term: None,
            conflict_index: 0,
        })
    }

    /// First index of the run of `term` entries that ends at `index`.
    fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index;
        while first > 1 && self.log.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    pub fn handle_append_response(
        &mut self,
        peer: &str,
        meta: AppendMeta,
        response: AppendEntriesResponse,
        now: Instant,
    ) -> Result<(), RaftError> {
        if response.term > self.state.current_term {
            return self.observe_term(response.term, now);
        }
        if self.state.role != NodeRole::Leader || meta.term != self.state.current_term {
            debug!("Node {} ignoring stale AppendEntries response from {peer}", self.id);
            return Ok(());
        }

        match self
            .replication
            .on_response(peer, meta, &response, self.log.as_ref())
        {
            ReplicationOutcome::Advanced { match_index } => {
                self.advance_commit_index()?;
                if match_index < self.log.last_index() {
                    self.replicate_to(peer)?;
                }
            }
            ReplicationOutcome::Retry { .. } => self.replicate_to(peer)?,
            ReplicationOutcome::Ignored => {}
        }
        Ok(())
    }

    /// Appends a client command. Only the leader accepts commands; others
    /// answer with the leader they last heard from.
    pub fn submit(&mut self, command: Vec<u8>) -> Result<u64, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.state.leader_id.clone(),
            });
        }

        let index = self.log.last_index() + 1;
        self.log
            .append(&[LogEntry::command(index, self.state.current_term, command)])?;
        debug!(
            "Node {} appended command at index {} (term {})",
            self.id, index, self.state.current_term
        );

        self.advance_commit_index()?;
        self.broadcast_append_entries()?;
        Ok(index)
    }

    /// Registers `tx` to learn when the entry at `index` commits, or that it
    /// was overwritten first.
    pub fn watch_commit(&mut self, index: u64, tx: CommitSender) {
        let Some(term) = self.log.term_at(index) else {
            let _ = tx.send(Err(RaftError::Indeterminate { index }));
            return;
        };
        if index <= self.state.commit_index {
            let _ = tx.send(Ok(index));
            return;
        }
        self.pending.insert(index, PendingCommand { term, tx });
    }

    fn advance_commit_index(&mut self) -> Result<(), RaftError> {
        if self.state.role != NodeRole::Leader {
            return Ok(());
        }

        let candidate = self
            .replication
            .quorum_index(self.log.last_index(), self.config.quorum());

        // Entries from earlier terms only commit underneath a current-term one.
        if candidate > self.state.commit_index
            && self.log.term_at(candidate) == Some(self.state.current_term)
        {
            debug!(
                "Node {} advancing commit index {} -> {}",
                self.id, self.state.commit_index, candidate
            );
            self.state.commit_index = candidate;
            self.resolve_pending();
        }
        Ok(())
    }

    fn resolve_pending(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.state.commit_index {
                break;
            }
            let (index, pending) = entry.remove_entry();
            let result = if self.log.term_at(index) == Some(pending.term) {
                Ok(index)
            } else {
                Err(RaftError::Indeterminate { index })
            };
            let _ = pending.tx.send(result);
        }
    }

    fn fail_pending_from(&mut self, index: u64) {
        for (index, pending) in self.pending.split_off(&index) {
            let _ = pending.tx.send(Err(RaftError::Indeterminate { index }));
        }
    }

    fn broadcast_append_entries(&mut self) -> Result<(), RaftError> {
        for peer in self.peers.clone() {
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    fn replicate_to(&mut self, peer: &str) -> Result<(), RaftError> {
        if let Some(request) = self.replication.build_request(
            peer,
            self.log.as_ref(),
            self.state.current_term,
            &self.id,
            self.state.commit_index,
        )? {
            self.outbox.push(Outbound::AppendEntries {
                peer: peer.to_string(),
                request,
            });
        }
        Ok(())
    }
}
