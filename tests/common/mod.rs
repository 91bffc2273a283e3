#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use raftcore::raft::{
    AppendMeta, LogEntry, LogStore, MemLogStore, MemStateStore, NodeRole, Outbound, RaftConfig,
    RaftError, RaftNode,
};
use tokio::time::Instant;

/// Deterministic in-process cluster. Nodes never run on their own: the test
/// decides when timers fire and when queued RPCs are delivered.
pub struct Cluster {
    pub nodes: BTreeMap<String, RaftNode>,
    ids: Vec<String>,
    stores: BTreeMap<String, MemStateStore>,
    crashed: BTreeMap<String, Vec<LogEntry>>,
    // Directed links that drop traffic.
    cut: HashSet<(String, String)>,
    pub now: Instant,
    /// Entries each node handed to its applier, in order.
    pub applied: BTreeMap<String, Vec<LogEntry>>,
    /// Every (term, leader) ever observed, for election safety checks.
    pub leaders: BTreeMap<u64, HashSet<String>>,
    // Last log seen from each (term, leader), for append-only checks.
    leader_logs: BTreeMap<(u64, String), Vec<LogEntry>>,
}

pub fn node_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("n{i}")).collect()
}

fn config_for(id: &str, ids: &[String]) -> RaftConfig {
    let mut cfg = RaftConfig::new(id, "unused");
    for peer in ids.iter().filter(|p| p.as_str() != id) {
        cfg.add_peer(peer, "in-process");
    }
    cfg
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        let ids = node_ids(n);
        let mut cluster = Self {
            nodes: BTreeMap::new(),
            ids: ids.clone(),
            stores: BTreeMap::new(),
            crashed: BTreeMap::new(),
            cut: HashSet::new(),
            now: Instant::now(),
            applied: BTreeMap::new(),
            leaders: BTreeMap::new(),
            leader_logs: BTreeMap::new(),
        };
        for id in &ids {
            let store = MemStateStore::new();
            cluster.boot(id, MemLogStore::new(), store);
            cluster.applied.insert(id.clone(), Vec::new());
        }
        cluster
    }

    fn boot(&mut self, id: &str, log: MemLogStore, store: MemStateStore) {
        let node = RaftNode::new(
            config_for(id, &self.ids),
            Box::new(log),
            Box::new(store.clone()),
        )
        .unwrap();
        self.stores.insert(id.to_string(), store);
        self.nodes.insert(id.to_string(), node);
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: &str) -> &mut RaftNode {
        self.nodes.get_mut(id).unwrap()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Stops a node, keeping only what it persisted.
    pub fn crash(&mut self, id: &str) {
        let node = self.nodes.remove(id).unwrap();
        let log = node.log();
        let entries = log.read_range(1, log.last_index() + 1).unwrap();
        self.crashed.insert(id.to_string(), entries);
    }

    /// Boots a crashed node from its persisted log and term/vote.
    pub fn restart(&mut self, id: &str) {
        let entries = self.crashed.remove(id).unwrap();
        let mut log = MemLogStore::new();
        log.append(&entries).unwrap();
        let store = self.stores[id].clone();
        self.boot(id, log, store);
    }

    pub fn is_up(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn isolate(&mut self, id: &str) {
        for other in &self.ids {
            if other != id {
                self.cut.insert((id.to_string(), other.clone()));
                self.cut.insert((other.clone(), id.to_string()));
            }
        }
    }

    /// Drops traffic between `a` and `b` in both directions.
    pub fn cut_link(&mut self, a: &str, b: &str) {
        self.cut.insert((a.to_string(), b.to_string()));
        self.cut.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    fn linked(&self, from: &str, to: &str) -> bool {
        !self.cut.contains(&(from.to_string(), to.to_string()))
    }

    pub fn leader(&self) -> Option<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role() == NodeRole::Leader)
            .max_by_key(|(_, n)| n.state().current_term)
            .map(|(id, _)| id.clone())
    }

    /// Starts an election on `id` and delivers all resulting traffic.
    pub fn elect(&mut self, id: &str) {
        let now = self.now;
        self.node_mut(id).start_election(now).unwrap();
        self.deliver_all();
    }

    /// Fires the leader's heartbeat timer and delivers the traffic.
    pub fn heartbeat(&mut self) {
        let Some(leader) = self.leader() else {
            return;
        };
        self.advance(Duration::from_millis(60));
        let now = self.now;
        let node = self.node_mut(&leader);
        let epoch = node.election_epoch();
        node.on_timer(epoch, now).unwrap();
        self.deliver_all();
    }

    pub fn submit(&mut self, id: &str, command: &[u8]) -> Result<u64, RaftError> {
        let result = self.node_mut(id).submit(command.to_vec());
        self.deliver_all();
        result
    }

    /// Queues a command on `id` without delivering anything.
    pub fn submit_quietly(&mut self, id: &str, command: &[u8]) -> Result<u64, RaftError> {
        self.node_mut(id).submit(command.to_vec())
    }

    /// Throws away whatever `id` has queued.
    pub fn drop_outbound(&mut self, id: &str) {
        self.node_mut(id).take_outbound();
    }

    /// Delivers queued RPCs and their responses until the cluster is quiet.
    pub fn deliver_all(&mut self) {
        for _ in 0..1000 {
            self.record();
            let mut queued = Vec::new();
            for (id, node) in self.nodes.iter_mut() {
                for outbound in node.take_outbound() {
                    queued.push((id.clone(), outbound));
                }
            }
            if queued.is_empty() {
                return;
            }
            for (from, outbound) in queued {
                self.deliver(&from, outbound);
            }
        }
        panic!("cluster did not quiesce");
    }

    fn deliver(&mut self, from: &str, outbound: Outbound) {
        let now = self.now;
        match outbound {
            Outbound::RequestVote { peer, request } => {
                if !self.is_up(&peer) || !self.linked(from, &peer) {
                    return;
                }
                let term = request.term;
                let response = self
                    .node_mut(&peer)
                    .handle_request_vote(request, now)
                    .unwrap();
                if self.is_up(from) && self.linked(&peer, from) {
                    self.node_mut(from)
                        .handle_vote_response(&peer, term, response, now)
                        .unwrap();
                }
            }
            Outbound::AppendEntries { peer, request } => {
                if !self.is_up(&peer) || !self.linked(from, &peer) {
                    return;
                }
                let meta = AppendMeta::from(&request);
                let response = self
                    .node_mut(&peer)
                    .handle_append_entries(request, now)
                    .unwrap();
                if self.is_up(from) && self.linked(&peer, from) {
                    self.node_mut(from)
                        .handle_append_response(&peer, meta, response, now)
                        .unwrap();
                }
            }
        }
    }

    fn record(&mut self) {
        for (id, node) in self.nodes.iter_mut() {
            let committed = node.take_committed().unwrap();
            self.applied.entry(id.clone()).or_default().extend(committed);
            if node.role() != NodeRole::Leader {
                continue;
            }
            let term = node.state().current_term;
            self.leaders.entry(term).or_default().insert(id.clone());

            // Leader append-only: within its term a leader only extends its log.
            let log = node.log();
            let current = log.read_range(1, log.last_index() + 1).unwrap();
            let key = (term, id.clone());
            if let Some(earlier) = self.leader_logs.get(&key) {
                assert!(
                    current.len() >= earlier.len() && current[..earlier.len()] == earlier[..],
                    "leader {id} rewrote its log in term {term}"
                );
            }
            self.leader_logs.insert(key, current);
        }
    }

    pub fn log_of(&self, id: &str) -> Vec<LogEntry> {
        let log = self.node(id).log();
        log.read_range(1, log.last_index() + 1).unwrap()
    }

    pub fn commit_index(&self, id: &str) -> u64 {
        self.node(id).state().commit_index
    }

    /// Checks the safety properties over every live node.
    pub fn assert_safety(&mut self) {
        self.record();

        for (term, leaders) in &self.leaders {
            assert!(leaders.len() <= 1, "term {term} had leaders {leaders:?}");
        }

        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for a in &ids {
            for b in &ids {
                let (la, lb) = (self.log_of(a), self.log_of(b));
                // Log matching: a shared (index, term) implies identical prefixes.
                for (ea, eb) in la.iter().zip(lb.iter()).rev() {
                    if ea.term == eb.term {
                        let n = ea.index as usize;
                        assert_eq!(la[..n], lb[..n], "logs of {a} and {b} diverge below {n}");
                        break;
                    }
                }
            }
        }

        // Leader completeness: the newest leader holds every committed entry.
        let newest = self.leaders.iter().next_back().map(|(term, ids)| (*term, ids.clone()));
        if let Some((term, ids)) = newest {
            for id in ids.iter().filter(|id| self.is_up(id)) {
                let node = self.node(id);
                if node.role() != NodeRole::Leader || node.state().current_term != term {
                    continue;
                }
                let log = self.log_of(id);
                for entry in self.applied.values().flatten() {
                    assert_eq!(
                        log.get(entry.index as usize - 1),
                        Some(entry),
                        "leader {id} of term {term} lacks committed entry {}",
                        entry.index
                    );
                }
            }
        }

        // State machine safety over everything ever applied.
        let mut by_index: BTreeMap<u64, &LogEntry> = BTreeMap::new();
        for entries in self.applied.values() {
            for entry in entries {
                if let Some(seen) = by_index.insert(entry.index, entry) {
                    assert_eq!(seen, entry, "two different entries applied at {}", entry.index);
                }
            }
        }
    }
}
