//! The pluggable ports: storage, transport, and the application state
//! machine (spec.md §6).
//!
//! The engine is single-threaded and cooperative (spec.md §5): it never
//! blocks waiting on a port. Every port operation submits work and returns
//! immediately; completion is reported back into the engine by the
//! embedder invoking the matching `on_*` method once the work finishes.
//! Ports therefore do not need to be `async fn` — they are plain,
//! synchronous traits whose methods either return immediately with a
//! result (for operations the spec treats as fast/local, like `time` or
//! `random`) or accept a `Ticket` that the embedder completes later.

use std::sync::Arc;

use crate::log::Entry;
use crate::membership::Configuration;
use crate::types::{LogId, NodeId};

/// Identifies one outstanding asynchronous port request, minted by the
/// engine and handed back unchanged on completion so the engine can match
/// the completion to its originator (spec.md §9: "a typed completion
/// channel... enough identity to be matched back").
pub type Ticket = u64;

/// The durable state loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub snapshot: Option<SnapshotMeta>,
    pub entries: Vec<Arc<Entry>>,
}

/// Metadata describing a persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_log_id: LogId,
    pub configuration: Configuration,
}

/// A snapshot together with its opaque FSM-provided payload.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Arc<[u8]>,
}

/// The storage port: durable persistence of term/vote/log/snapshot.
///
/// Every method that the spec says "is durable before returning success"
/// is represented here as a submission (`*_begin`) paired with a ticket;
/// the embedder calls the matching `RaftEngine::on_*_complete` once the
/// write has actually reached stable storage. `load` and `bootstrap` are
/// modeled as synchronous because they only ever happen once, before the
/// engine starts ticking.
pub trait Storage {
    /// Read back everything persisted for this node. Called once, before
    /// the engine starts.
    fn load(&mut self) -> crate::error::RaftResult<LoadedState>;

    /// Write the initial configuration entry (index 1, term 1). Fails if
    /// any state already exists for this node.
    fn bootstrap(&mut self, configuration: &Configuration) -> crate::error::RaftResult<()>;

    /// Durably record `term`/`voted_for` before returning.
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> crate::error::RaftResult<()>;

    /// Submit entries to be made durable. The embedder must call
    /// `RaftEngine::on_append_complete(ticket, ..)` once they are.
    fn append_begin(&mut self, ticket: Ticket, entries: &[Arc<Entry>]);

    /// Submit a truncate-from-`index` request (durable before the
    /// matching completion fires).
    fn truncate_begin(&mut self, ticket: Ticket, from_index: u64);

    /// Submit a snapshot for durable storage.
    fn snapshot_put_begin(&mut self, ticket: Ticket, snapshot: Snapshot);

    /// Request the currently stored snapshot, if any.
    fn snapshot_get_begin(&mut self, ticket: Ticket);

    /// Monotonic milliseconds, used to drive election/heartbeat timing.
    fn time_ms(&self) -> u64;

    /// A pseudo-random integer in `[min, max)`, used for election timeout
    /// jitter. Implementations must make this deterministic under a fixed
    /// seed so simulations can be reproduced.
    fn random(&mut self, min: u64, max: u64) -> u64;

    /// Opt-in: turn on defensive consistency checking of this port's
    /// returned state (log contiguity, snapshot/log overlap) after
    /// `load()`. The default impl returns `false`, i.e. no checking.
    fn defensive(&self) -> bool {
        false
    }
}

/// Outbound protocol messages, mirroring spec.md §6's four kinds.
#[derive(Debug, Clone)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntries),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResult(InstallSnapshotResult),
}

#[derive(Debug, Clone)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct RequestVoteResult {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Arc<Entry>>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResult {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_index: u64,
    pub last_term: u64,
    pub conf_index: u64,
    pub configuration: Configuration,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResult {
    pub term: u64,
}

/// The transport port: sending protocol messages to peers.
///
/// Wire-level encoding is the transport's concern; the engine only ever
/// exchanges the abstract [`Message`] variants above.
pub trait Transport {
    /// Submit `message` for delivery to `target`. Fire-and-forget from the
    /// engine's perspective: the protocol tolerates reordering and loss of
    /// outbound messages (spec.md §5), so there is no completion ticket.
    fn send(&mut self, target: NodeId, message: Message);
}

/// The application's replicated state machine.
pub trait Fsm {
    /// Apply a committed command payload, returning an application-defined
    /// result.
    fn apply(&mut self, payload: &[u8]) -> crate::error::RaftResult<Vec<u8>>;

    /// Produce a serialized snapshot of the current state machine.
    fn snapshot(&mut self) -> crate::error::RaftResult<Arc<[u8]>>;

    /// Replace the state machine's state with a previously-snapshotted
    /// payload.
    fn restore(&mut self, payload: &[u8]) -> crate::error::RaftResult<()>;
}
