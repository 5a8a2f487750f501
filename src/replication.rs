//! Leader-side replication bookkeeping: per-follower progress, quorum
//! computation, and the commit rule (spec.md §4.3).

use std::collections::BTreeMap;

use crate::types::NodeId;

/// A follower's replication mode, mirroring `async-raft`'s
/// `TargetReplState` but reshaped as plain per-follower state owned by the
/// leader rather than a spawned actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Waiting to confirm the follower's log position before pipelining.
    Probe,
    /// Steady-state: entries are sent as soon as they're appended.
    Pipeline,
    /// The follower has fallen far enough behind that the leader is
    /// installing a snapshot instead of replaying the log.
    Snapshot,
}

/// The leader's tracked belief about one follower's log state.
#[derive(Debug, Clone)]
pub struct Progress {
    pub next_index: u64,
    pub match_index: u64,
    pub last_contact: u64,
    pub state: ReplicationState,
}

impl Progress {
    fn new(last_index: u64, now: u64) -> Self {
        Self {
            next_index: last_index + 1,
            match_index: 0,
            last_contact: now,
            state: ReplicationState::Probe,
        }
    }
}

/// Owns one [`Progress`] per voting and non-voting member the leader is
/// replicating to.
#[derive(Debug, Default)]
pub struct ReplicationTracker {
    progress: BTreeMap<NodeId, Progress>,
}

impl ReplicationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset progress for every peer to the state a freshly elected leader
    /// starts with: `next_index = last_index + 1`, `match_index = 0`,
    /// `state = probe`, with `last_contact` seeded to `now` so the
    /// step-down check doesn't trip before the first round-trip
    /// (spec.md §4.3).
    pub fn reset_for(&mut self, peers: Vec<NodeId>, last_index: u64, now: u64) {
        self.progress.clear();
        for peer in peers {
            self.progress.insert(peer, Progress::new(last_index, now));
        }
    }

    pub fn add_member(&mut self, id: NodeId, last_index: u64, now: u64) {
        self.progress.entry(id).or_insert_with(|| Progress::new(last_index, now));
    }

    pub fn remove_member(&mut self, id: NodeId) {
        self.progress.remove(&id);
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Progress)> {
        self.progress.iter()
    }

    pub fn set_state(&mut self, id: NodeId, state: ReplicationState) {
        if let Some(p) = self.progress.get_mut(&id) {
            p.state = state;
        }
    }

    /// True if the follower hasn't had a successful contact in over
    /// `stale_contact_ms`, or is already known to need a snapshot: the
    /// leader then falls back to a heartbeat-only send rather than
    /// re-replicating a long log to an unreachable peer (spec.md §4.3
    /// rule 1).
    pub fn is_stale(&self, id: NodeId, now: u64, stale_contact_ms: u64) -> bool {
        match self.progress.get(&id) {
            Some(p) => p.state == ReplicationState::Snapshot || now.saturating_sub(p.last_contact) > stale_contact_ms,
            None => false,
        }
    }

    pub fn mark_contact(&mut self, id: NodeId, now: u64) {
        if let Some(p) = self.progress.get_mut(&id) {
            p.last_contact = now;
        }
    }

    /// Record a successful AppendEntries reply: advance `match_index` and
    /// `next_index`, and promote out of `probe` into `pipeline` once the
    /// follower is caught up to the leader's log at the time of the reply.
    pub fn record_success(&mut self, id: NodeId, last_log_index: u64, now: u64) {
        if let Some(p) = self.progress.get_mut(&id) {
            p.match_index = p.match_index.max(last_log_index);
            p.next_index = p.match_index + 1;
            p.last_contact = now;
            if p.state == ReplicationState::Probe {
                p.state = ReplicationState::Pipeline;
            }
        }
    }

    /// Record a log-mismatch AppendEntries failure: back `next_index` off
    /// toward the follower's reported position (or by one, if the reply
    /// carries no useful hint), floored at 1 (spec.md §4.3).
    pub fn record_mismatch(&mut self, id: NodeId, hint_last_log_index: Option<u64>, local_last_index: u64) {
        if let Some(p) = self.progress.get_mut(&id) {
            let candidate = match hint_last_log_index {
                Some(hint) => hint.min(local_last_index),
                None => p.next_index.saturating_sub(1),
            };
            p.next_index = candidate.max(1);
            p.state = ReplicationState::Probe;
        }
    }

    /// The leader's belief about the replicated-commit candidate: the
    /// median of `match_index` across voters, including the leader itself
    /// (implicitly at `leader_last_stored`), per spec.md §4.3's commit
    /// rule. Non-voters never count toward quorum and aren't in `voters`.
    pub fn commit_candidate(&self, voters: &[NodeId], leader_id: NodeId, leader_last_stored: u64) -> u64 {
        let mut indices: Vec<u64> = voters
            .iter()
            .map(|id| {
                if *id == leader_id {
                    leader_last_stored
                } else {
                    self.progress.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if indices.is_empty() {
            return 0;
        }
        indices.sort_unstable();
        indices[indices.len() / 2]
    }

    /// True if a strict majority of voters (including the leader itself)
    /// have been contacted within the last `timeout` ms, used by the
    /// leader's step-down-if-partitioned rule (spec.md §4.2 leader tick
    /// rule 1).
    pub fn majority_contacted_within(&self, voters: &[NodeId], leader_id: NodeId, now: u64, timeout: u64) -> bool {
        if voters.is_empty() {
            return true;
        }
        let contacted = voters
            .iter()
            .filter(|id| {
                **id == leader_id
                    || self
                        .progress
                        .get(*id)
                        .map(|p| now.saturating_sub(p.last_contact) <= timeout)
                        .unwrap_or(false)
            })
            .count();
        contacted * 2 > voters.len()
    }
}
