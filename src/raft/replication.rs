use std::collections::BTreeMap;
// Use external log crate, not our own log module
use ::log::debug;

use super::{AppendEntriesRequest, AppendEntriesResponse, AppendMeta, LogStore, RaftError};

/// Leader-side view of one follower's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    pub next_index: u64,
    pub match_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The follower acknowledged; `match_index` is its progress afterwards.
    Advanced { match_index: u64 },
    /// Log mismatch: `next_index` moved back, resend to this peer now.
    Retry { next_index: u64 },
    /// Response to a request that no longer reflects the peer's progress.
    Ignored,
}

/// Per-peer `next_index`/`match_index` bookkeeping. Each peer progresses on
/// its own; nothing here waits on any other peer.
#[derive(Debug)]
pub struct ReplicationManager {
    progress: BTreeMap<String, PeerProgress>,
    max_append_entries: usize,
}

impl ReplicationManager {
    pub fn new(max_append_entries: usize) -> Self {
        Self {
            progress: BTreeMap::new(),
            max_append_entries: max_append_entries.max(1),
        }
    }

    /// Re-initializes progress for a new leadership term.
    pub fn reset(&mut self, peers: &[String], last_log_index: u64) {
        self.progress = peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerProgress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.progress.clear();
    }

    pub fn progress(&self, peer: &str) -> Option<PeerProgress> {
        self.progress.get(peer).copied()
    }

    /// AppendEntries for `peer` carrying everything from its `next_index`
    /// onward, up to the batch limit. Empty entries make it a heartbeat.
    pub fn build_request(
        &self,
        peer: &str,
        log: &dyn LogStore,
        term: u64,
        leader_id: &str,
        leader_commit: u64,
    ) -> Result<Option<AppendEntriesRequest>, RaftError> {
        let Some(progress) = self.progress.get(peer) else {
            return Ok(None);
        };

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = log
            .term_at(prev_log_index)
            .ok_or(RaftError::InvalidLogIndex(prev_log_index))?;
        let end = (progress.next_index + self.max_append_entries as u64).min(log.last_index() + 1);
        let entries = log.read_range(progress.next_index, end)?;

        Ok(Some(AppendEntriesRequest {
            term,
            leader_id: leader_id.to_string(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }))
    }

    pub fn on_response(
        &mut self,
        peer: &str,
        meta: AppendMeta,
        resp: &AppendEntriesResponse,
        log: &dyn LogStore,
    ) -> ReplicationOutcome {
        let Some(progress) = self.progress.get_mut(peer) else {
            return ReplicationOutcome::Ignored;
        };

        if resp.success {
            // Reordered acks must never move progress backwards.
            let matched = meta.prev_log_index + meta.entries_len;
            progress.match_index = progress.match_index.max(matched);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            return ReplicationOutcome::Advanced {
                match_index: progress.match_index,
            };
        }

        if meta.prev_log_index + 1 != progress.next_index {
            debug!(
                "Ignoring stale rejection from {peer} (prev_log_index {}, next_index {})",
                meta.prev_log_index, progress.next_index
            );
            return ReplicationOutcome::Ignored;
        }

        let hint = match resp.conflict_term {
            Some(term) => last_index_of_term(log, term, meta.prev_log_index)
                .map(|idx| idx + 1)
                .unwrap_or(resp.conflict_index),
            None => resp.conflict_index,
        };
        let lower = progress.match_index + 1;
        let upper = progress.next_index.saturating_sub(1).max(lower);
        progress.next_index = hint.clamp(lower, upper);

        debug!(
            "Log mismatch with {peer}, next_index backed off to {}",
            progress.next_index
        );
        ReplicationOutcome::Retry {
            next_index: progress.next_index,
        }
    }

    /// Highest index stored on at least `quorum` nodes, the leader included.
    pub fn quorum_index(&self, leader_last_index: u64, quorum: usize) -> u64 {
        let mut indices: Vec<u64> = self.progress.values().map(|p| p.match_index).collect();
        indices.push(leader_last_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices
            .get(quorum.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }
}

/// Last index at or below `upto` whose entry has `term`.
fn last_index_of_term(log: &dyn LogStore, term: u64, upto: u64) -> Option<u64> {
    let mut idx = upto.min(log.last_index());
    while idx > 0 {
        match log.term_at(idx) {
            Some(t) if t == term => return Some(idx),
            Some(t) if t < term => return None,
            _ => idx -= 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{LogEntry, MemLogStore};

    fn leader_log(terms: &[u64]) -> MemLogStore {
        let mut log = MemLogStore::new();
        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| LogEntry::command(i as u64 + 1, t, vec![]))
            .collect();
        log.append(&entries).expect("append");
        log
    }

    fn peers() -> Vec<String> {
        vec!["b".to_string(), "c".to_string()]
    }

    fn rejection(conflict_term: Option<u64>, conflict_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: 3,
            success: false,
            match_index: 0,
            conflict_term,
            conflict_index,
        }
    }

    #[test]
    fn reset_points_every_peer_past_the_leader_log() {
        let mut repl = ReplicationManager::new(8);
        repl.reset(&peers(), 5);
        assert_eq!(
            repl.progress("b"),
            Some(PeerProgress {
                next_index: 6,
                match_index: 0
            })
        );
    }

    #[test]
    fn build_request_respects_batch_limit() {
        let log = leader_log(&[1, 1, 2, 2, 3]);
        let mut repl = ReplicationManager::new(2);
        repl.reset(&peers(), 0);

        let req = repl
            .build_request("b", &log, 3, "a", 0)
            .expect("build")
            .expect("known peer");
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.prev_log_term, 0);
        assert_eq!(req.entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);

        assert!(repl.build_request("zz", &log, 3, "a", 0).expect("build").is_none());
    }

    #[test]
    fn success_advances_and_reordered_ack_does_not_regress() {
        let log = leader_log(&[1, 1, 1]);
        let mut repl = ReplicationManager::new(8);
        repl.reset(&peers(), 0);

        let ok = AppendEntriesResponse {
            term: 1,
            success: true,
            match_index: 3,
            conflict_term: None,
            conflict_index: 0,
        };
        let newer = AppendMeta { term: 1, prev_log_index: 0, entries_len: 3 };
        let older = AppendMeta { term: 1, prev_log_index: 0, entries_len: 1 };

        assert_eq!(
            repl.on_response("b", newer, &ok, &log),
            ReplicationOutcome::Advanced { match_index: 3 }
        );
        assert_eq!(
            repl.on_response("b", older, &ok, &log),
            ReplicationOutcome::Advanced { match_index: 3 }
        );
        assert_eq!(repl.progress("b").unwrap().next_index, 4);
    }

    #[test]
    fn short_follower_log_backs_off_to_its_length() {
        let log = leader_log(&[1, 1, 2, 2, 3]);
        let mut repl = ReplicationManager::new(8);
        repl.reset(&peers(), 5);

        let meta = AppendMeta { term: 3, prev_log_index: 5, entries_len: 0 };
        let outcome = repl.on_response("b", meta, &rejection(None, 3), &log);
        assert_eq!(outcome, ReplicationOutcome::Retry { next_index: 3 });
    }

    #[test]
    fn conflicting_term_skips_whole_term() {
        // Leader has term 2 up to index 4; follower reports conflicting term 2.
        let log = leader_log(&[1, 1, 2, 2, 3]);
        let mut repl = ReplicationManager::new(8);
        repl.reset(&peers(), 5);

        let meta = AppendMeta { term: 3, prev_log_index: 5, entries_len: 0 };
        let outcome = repl.on_response("b", meta, &rejection(Some(2), 3), &log);
        assert_eq!(outcome, ReplicationOutcome::Retry { next_index: 5 });

        // Term unknown to the leader: fall back to the follower's first index of it.
        let meta = AppendMeta { term: 3, prev_log_index: 4, entries_len: 1 };
        let outcome = repl.on_response("b", meta, &rejection(Some(9), 2), &log);
        assert_eq!(outcome, ReplicationOutcome::Retry { next_index: 2 });
    }

    #[test]
    fn backoff_always_makes_progress_and_stale_rejections_are_ignored() {
        let log = leader_log(&[1, 1, 1]);
        let mut repl = ReplicationManager::new(8);
        repl.reset(&peers(), 3);

        // A useless hint still moves next_index down by one.
        let meta = AppendMeta { term: 1, prev_log_index: 3, entries_len: 0 };
        let outcome = repl.on_response("b", meta, &rejection(None, 10), &log);
        assert_eq!(outcome, ReplicationOutcome::Retry { next_index: 3 });

        // The same rejection again no longer matches next_index.
        assert_eq!(
            repl.on_response("b", meta, &rejection(None, 10), &log),
            ReplicationOutcome::Ignored
        );
    }

    #[test]
    fn quorum_index_counts_leader() {
        let log = leader_log(&[1, 1, 1, 1]);
        let mut repl = ReplicationManager::new(8);
        repl.reset(&["b".into(), "c".into(), "d".into(), "e".into()], 4);

        let ok = AppendEntriesResponse {
            term: 1,
            success: true,
            match_index: 0,
            conflict_term: None,
            conflict_index: 0,
        };
        repl.on_response("b", AppendMeta { term: 1, prev_log_index: 0, entries_len: 4 }, &ok, &log);
        assert_eq!(repl.quorum_index(4, 3), 0);

        repl.on_response("c", AppendMeta { term: 1, prev_log_index: 0, entries_len: 2 }, &ok, &log);
        assert_eq!(repl.quorum_index(4, 3), 2);
    }
}
