//! Observability: a point-in-time snapshot of an engine's state, published
//! after every transition over a `tokio::sync::watch` channel.
//!
//! This mirrors `async-raft::metrics`: the engine never awaits and does
//! not require a Tokio runtime to run at all, but `watch` is a convenient,
//! already-in-the-dependency-tree primitive for "latest value, many
//! readers" broadcast, so it is used here purely as a data structure, not
//! as a reason to pull in the rest of Tokio.

use std::time::Duration;

use tokio::sync::watch;

use crate::membership::Configuration;
use crate::types::NodeId;

/// Which role a node currently believes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unavailable,
    Follower,
    Candidate,
    Leader,
    NonVoter,
}

/// Why a node most recently converted to follower, kept for operational
/// visibility (spec.md §0.6: "distinguish 'partitioned' from 'removed from
/// configuration' from 'higher term observed'"). `None` until the first
/// such conversion; sticky across ticks until the node converts again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDownReason {
    /// A peer's message carried a term higher than ours.
    HigherTerm,
    /// This node was leader but lost contact with a majority of voters
    /// within one election timeout.
    Partitioned,
    /// A committed configuration entry no longer lists this node.
    RemovedFromConfiguration,
}

/// Per-follower replication progress, exposed only when this node is
/// leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderMetrics {
    pub match_index: std::collections::BTreeMap<NodeId, u64>,
}

/// A snapshot of one engine's externally-visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub configuration: Configuration,
    pub snapshot_last_log_index: u64,
    pub leader_metrics: Option<LeaderMetrics>,
    pub last_step_down_reason: Option<StepDownReason>,
}

impl RaftMetrics {
    pub fn unavailable(id: NodeId) -> Self {
        Self {
            id,
            state: State::Unavailable,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            configuration: Configuration::default(),
            snapshot_last_log_index: 0,
            leader_metrics: None,
            last_step_down_reason: None,
        }
    }
}

/// The writer half held by the engine; `subscribe()` hands out readers.
pub struct MetricsReporter {
    tx: watch::Sender<RaftMetrics>,
}

impl MetricsReporter {
    pub fn new(initial: RaftMetrics) -> (Self, watch::Receiver<RaftMetrics>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    pub fn report(&self, metrics: RaftMetrics) {
        // A closed receiver set just means nobody is watching; that is
        // not an error condition for the engine.
        let _ = self.tx.send(metrics);
    }
}

/// Checks a metrics channel against a predicate without blocking or
/// requiring a Tokio runtime.
///
/// The engine never awaits (spec.md §5), so `Wait` cannot either: it is
/// driven by repeated, non-blocking `poll` calls from a caller that owns
/// its own notion of time, namely the `fixture`'s `step_until_*` helpers,
/// each of which calls `poll` once per simulated step until it returns
/// `Some` or the caller's own step budget is exhausted.
pub struct Wait {
    rx: watch::Receiver<RaftMetrics>,
    deadline: Option<std::time::Instant>,
}

impl Wait {
    pub fn new(rx: watch::Receiver<RaftMetrics>, timeout: Duration) -> Self {
        Self {
            rx,
            deadline: std::time::Instant::now().checked_add(timeout),
        }
    }

    /// Returns the current snapshot if `predicate` holds for it, `None`
    /// otherwise (including once the deadline passed).
    pub fn poll(&mut self, mut predicate: impl FnMut(&RaftMetrics) -> bool) -> Option<RaftMetrics> {
        if let Some(deadline) = self.deadline {
            if std::time::Instant::now() > deadline {
                return None;
            }
        }
        let snapshot = self.rx.borrow_and_update().clone();
        if predicate(&snapshot) {
            Some(snapshot)
        } else {
            None
        }
    }
}
