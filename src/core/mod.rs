//! The role state machine: follower, candidate, leader, non-voter, and the
//! tick/message entry points that drive it (spec.md §4.2).

mod apply;
mod append_entries;
mod install_snapshot;
mod membership;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{RaftError, RaftResult};
use crate::io::{self, Fsm, LoadedState, Message, Storage, Ticket, Transport};
use crate::log::{EntryType, Log};
use crate::membership::Configuration;
use crate::metrics::{self, MetricsReporter, RaftMetrics};
use crate::replication::ReplicationTracker;
use crate::snapshot::SnapshotState;
use crate::types::NodeId;

pub use vote::CandidateState;

/// Follower-role substate.
#[derive(Debug, Clone, Default)]
pub struct FollowerState {
    pub current_leader: Option<(NodeId, String)>,
}

/// Bookkeeping for an in-flight non-voter catch-up (spec.md §4.7).
#[derive(Debug, Clone)]
pub struct PromoteState {
    pub id: NodeId,
    pub round: u64,
    pub round_start_match: u64,
    pub round_start_time: u64,
    pub cumulative_duration_ms: u64,
}

/// Leader-role substate.
#[derive(Default)]
pub struct LeaderState {
    pub replication: ReplicationTracker,
    pub promotee: Option<PromoteState>,
    /// Pending `apply_request` callbacks, keyed by the log index they were
    /// appended at.
    pub pending_applies: BTreeMap<u64, ApplyCallback>,
}

/// A caller-supplied completion for `apply_request`.
pub type ApplyCallback = Box<dyn FnOnce(RaftResult<Vec<u8>>)>;

/// Which role this node currently occupies.
pub enum Role {
    /// Before `start()`, or after a fatal error / `close()`.
    Unavailable,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    /// A configured-but-not-yet-voting member: replicates but never
    /// starts an election.
    NonVoter,
}

impl Role {
    fn metrics_state(&self) -> metrics::State {
        match self {
            Role::Unavailable => metrics::State::Unavailable,
            Role::Follower(_) => metrics::State::Follower,
            Role::Candidate(_) => metrics::State::Candidate,
            Role::Leader(_) => metrics::State::Leader,
            Role::NonVoter => metrics::State::NonVoter,
        }
    }
}

/// What a completed storage append or truncate was for, so the matching
/// `on_*_complete` call can finish the right piece of work.
enum PendingOp {
    /// A follower is durably persisting a leader's AppendEntries before
    /// replying.
    FollowerAppend { leader_id: NodeId, leader_commit: u64 },
    /// The leader is durably persisting an entry it just created locally
    /// (client command, barrier, or configuration change).
    LeaderAppend,
    FollowerTruncate,
    /// The leader is persisting a snapshot it just took of its own FSM;
    /// on completion the log is shifted forward (spec.md §4.3).
    TakeSnapshot,
    /// A follower is persisting a snapshot pushed by `InstallSnapshot`;
    /// on completion its applied/commit state and configuration catch up
    /// and the reply goes out (spec.md §4.6).
    InstallSnapshot {
        leader_id: NodeId,
        last_log_id: crate::types::LogId,
        configuration: Configuration,
        configuration_index: u64,
    },
    /// A leader is fetching the current snapshot's bytes from storage
    /// before it can serve an `InstallSnapshot` to `target` (spec.md §4.3).
    SnapshotGet { target: NodeId },
}

/// The Raft engine for a single node. Generic over the three pluggable
/// ports (spec.md §6); owns no threads and performs no I/O directly.
pub struct RaftEngine<S, T, F> {
    id: NodeId,
    address: String,
    config: Config,
    storage: S,
    transport: T,
    fsm: F,

    log: Log,
    configuration: Configuration,
    configuration_index: u64,
    configuration_uncommitted_index: u64,

    current_term: u64,
    voted_for: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    snapshot: SnapshotState,
    /// The bytes of the most recently taken or installed snapshot, cached
    /// on the engine so a leader can serve `InstallSnapshot` sends without
    /// a round trip through `Storage::snapshot_get_begin`.
    last_snapshot_bytes: Option<Arc<[u8]>>,
    /// Set between `maybe_take_snapshot` submitting a snapshot and its
    /// `on_snapshot_put_complete`, so the completion knows where to shift
    /// the log to.
    pending_snapshot_meta: Option<io::SnapshotMeta>,

    role: Role,
    timer_ms: u64,
    election_timeout_rand: u64,
    /// Why this node most recently converted to follower, for
    /// `RaftMetrics::last_step_down_reason` (spec.md §0.6).
    last_step_down_reason: Option<metrics::StepDownReason>,

    next_ticket: Ticket,
    pending: BTreeMap<Ticket, PendingOp>,

    metrics: MetricsReporter,
    metrics_rx: tokio::sync::watch::Receiver<RaftMetrics>,

    closed: bool,
}

impl<S, T, F> RaftEngine<S, T, F>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    /// Create a new engine. Role starts `Unavailable`; call
    /// [`RaftEngine::load_and_start`] to bring it up.
    pub fn new(id: NodeId, address: impl Into<String>, config: Config, storage: S, transport: T, fsm: F) -> Self {
        let address = address.into();
        let (metrics, metrics_rx) = MetricsReporter::new(RaftMetrics::unavailable(id));
        Self {
            id,
            address,
            config,
            storage,
            transport,
            fsm,
            log: Log::new(),
            configuration: Configuration::default(),
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            snapshot: SnapshotState::default(),
            last_snapshot_bytes: None,
            pending_snapshot_meta: None,
            role: Role::Unavailable,
            timer_ms: 0,
            election_timeout_rand: 0,
            last_step_down_reason: None,
            next_ticket: 1,
            pending: BTreeMap::new(),
            metrics,
            metrics_rx,
            closed: false,
        }
    }

    /// Write the initial configuration (bootstrap), exactly once across
    /// the cluster's lifetime.
    pub fn bootstrap(&mut self) -> RaftResult<()> {
        let configuration = Configuration::new_initial(self.id, self.address.clone());
        self.storage.bootstrap(&configuration)?;
        Ok(())
    }

    /// Load persisted state and start the engine as a follower (spec.md
    /// §3 lifecycle: Load then Start).
    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub fn load_and_start(&mut self) -> RaftResult<()> {
        let LoadedState {
            current_term,
            voted_for,
            snapshot,
            entries,
        } = self.storage.load()?;
        if self.storage.defensive() {
            check_loaded_state_consistency(&snapshot, &entries)?;
        }
        self.current_term = current_term;
        self.voted_for = voted_for;
        if let Some(meta) = snapshot {
            self.log.set_offset(meta.last_log_id.index);
            self.configuration = meta.configuration.clone();
            self.last_applied = meta.last_log_id.index;
            self.commit_index = meta.last_log_id.index;
            self.snapshot.set(meta);
        }
        for entry in entries {
            if entry.entry_type == EntryType::Configuration {
                if let Some(cfg) = entry.as_configuration() {
                    self.configuration = cfg;
                    self.configuration_index = entry.index;
                }
            }
            self.reinsert_loaded_entry(&entry);
        }
        self.become_follower(self.current_term, None, None);
        self.report_metrics();
        Ok(())
    }

    fn reinsert_loaded_entry(&mut self, entry: &crate::log::Entry) {
        // Entries come from storage already in order; the in-memory log
        // is rebuilt by re-appending them verbatim.
        match entry.entry_type {
            EntryType::Command => {
                self.log.append(entry.term, EntryType::Command, entry.payload().to_vec());
            }
            EntryType::Configuration => {
                self.log
                    .append(entry.term, EntryType::Configuration, entry.payload().to_vec());
            }
            EntryType::Barrier => {
                self.log.append_barrier(entry.term);
            }
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn metrics_receiver(&self) -> tokio::sync::watch::Receiver<RaftMetrics> {
        self.metrics_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// The term of the log's last entry, falling back to the installed
    /// snapshot's term when the log is empty at exactly the snapshot's
    /// boundary (`Log::last_term` only ever looks at live entries, so
    /// right after installing or loading a snapshot it would otherwise
    /// under-report a node that's actually fully caught up).
    fn last_log_term(&self) -> u64 {
        let last_index = self.log.last_index();
        let term = self.log.last_term();
        if term != 0 || last_index == 0 {
            term
        } else if last_index == self.snapshot.last_log_id().index {
            self.snapshot.last_log_id().term
        } else {
            0
        }
    }

    /// Milliseconds remaining before this engine's role-driven timer would
    /// next fire on its own (an election timeout for followers/candidates,
    /// a heartbeat for leaders), if `on_tick` is never called sooner with
    /// a larger delta. `None` when no timer is running (`Unavailable` or
    /// `NonVoter`). An embedder that only wants to tick engines when
    /// something would actually happen can use this to jump its clock
    /// straight to the next event instead of polling at a fixed quantum.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        match &self.role {
            Role::Unavailable | Role::NonVoter => None,
            Role::Follower(_) | Role::Candidate(_) => Some(self.election_timeout_rand.saturating_sub(self.timer_ms)),
            Role::Leader(_) => Some(self.config.heartbeat_timeout_ms.saturating_sub(self.timer_ms)),
        }
    }

    fn next_ticket(&mut self) -> Ticket {
        let t = self.next_ticket;
        self.next_ticket += 1;
        t
    }

    fn current_leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower(f) => f.current_leader.as_ref().map(|(id, _)| *id),
            Role::Leader(_) => Some(self.id),
            _ => None,
        }
    }

    fn current_leader_address(&self) -> Option<(NodeId, String)> {
        match &self.role {
            Role::Follower(f) => f.current_leader.clone(),
            Role::Leader(_) => Some((self.id, self.address.clone())),
            _ => None,
        }
    }

    fn not_leader_error(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self.current_leader_address(),
        }
    }

    pub(crate) fn report_metrics(&self) {
        let leader_metrics = match &self.role {
            Role::Leader(l) => Some(metrics::LeaderMetrics {
                match_index: l.replication.iter().map(|(id, p)| (*id, p.match_index)).collect(),
            }),
            _ => None,
        };
        self.metrics.report(RaftMetrics {
            id: self.id,
            state: self.role.metrics_state(),
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader_id(),
            configuration: self.configuration.clone(),
            snapshot_last_log_index: self.snapshot.last_log_id().index,
            leader_metrics,
            last_step_down_reason: self.last_step_down_reason,
        });
    }

    fn draw_election_timeout(&mut self) -> u64 {
        self.storage
            .random(self.config.election_timeout_min_ms, self.config.election_timeout_max_ms)
    }

    fn reset_election_timer(&mut self) {
        self.timer_ms = 0;
        self.election_timeout_rand = self.draw_election_timeout();
    }

    /// Common transition logic: reset the election timer and any
    /// role-specific caches (spec.md §4.2 "Transitions"). `reason` is
    /// `None` only for the initial startup transition, which is not a
    /// step-down; every other caller passes the concrete cause so
    /// `last_step_down_reason` (spec.md §0.6) stays meaningful.
    #[instrument(level = "debug", skip(self, leader), fields(id = self.id, term))]
    fn become_follower(&mut self, term: u64, leader: Option<(NodeId, String)>, reason: Option<metrics::StepDownReason>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            if let Err(err) = self.storage.save_term_and_vote(self.current_term, self.voted_for) {
                self.fatal(err);
                return;
            }
        }
        if let Some(reason) = reason {
            self.last_step_down_reason = Some(reason);
        }
        self.reset_election_timer();
        self.role = if self.configuration.is_voter(self.id) {
            Role::Follower(FollowerState { current_leader: leader })
        } else {
            Role::NonVoter
        };
        self.report_metrics();
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    fn become_candidate(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        if let Err(err) = self.storage.save_term_and_vote(self.current_term, self.voted_for) {
            self.fatal(err);
            return;
        }
        self.reset_election_timer();
        let mut votes = BTreeMap::new();
        votes.insert(self.id, true);
        self.role = Role::Candidate(CandidateState { votes });
        debug!(term = self.current_term, "starting election");
        self.broadcast_request_vote();
        self.report_metrics();
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id, term = self.current_term))]
    fn become_leader(&mut self) {
        let now = self.storage.time_ms();
        let last_index = self.log.last_index();
        let mut tracker = ReplicationTracker::new();
        let peers: Vec<NodeId> = self.configuration.all_ids().filter(|id| *id != self.id).collect();
        tracker.reset_for(peers, last_index, now);
        self.role = Role::Leader(LeaderState {
            replication: tracker,
            promotee: None,
            pending_applies: BTreeMap::new(),
        });
        self.reset_election_timer();
        // A blank entry commits prior-term entries under the current
        // term, per the dissertation's leader-completeness argument.
        self.append_local_entry(EntryType::Barrier, Vec::new());
        self.replicate_to_all();
        self.report_metrics();
    }

    // ---- tick -------------------------------------------------------

    /// Advance the engine's clock by `delta_ms` and apply whichever tick
    /// rule matches the current role (spec.md §4.2).
    #[instrument(level = "trace", skip(self), fields(id = self.id))]
    pub fn on_tick(&mut self, delta_ms: u64) {
        if self.closed {
            return;
        }
        self.timer_ms += delta_ms;
        match &self.role {
            Role::Unavailable | Role::NonVoter => {}
            Role::Follower(_) => self.follower_tick(),
            Role::Candidate(_) => self.candidate_tick(),
            Role::Leader(_) => self.leader_tick(),
        }
    }

    fn follower_tick(&mut self) {
        if self.configuration.is_voter(self.id) && self.timer_ms > self.election_timeout_rand {
            self.become_candidate();
        }
    }

    fn candidate_tick(&mut self) {
        if self.timer_ms > self.election_timeout_rand {
            self.become_candidate();
        }
    }

    fn leader_tick(&mut self) {
        let now = self.storage.time_ms();
        let voters: Vec<NodeId> = self.configuration.voters().map(|s| s.id).collect();
        let timeout = self.election_timeout_rand.max(1);

        // Rule 1: step down if partitioned from a majority.
        let majority_ok = if let Role::Leader(l) = &self.role {
            l.replication.majority_contacted_within(&voters, self.id, now, timeout)
        } else {
            true
        };
        if !majority_ok {
            warn!(id = self.id, "stepping down: lost contact with majority");
            let term = self.current_term;
            self.become_follower(term, None, Some(metrics::StepDownReason::Partitioned));
            return;
        }

        // Rule 2: heartbeat.
        if self.timer_ms > self.config.heartbeat_timeout_ms {
            self.timer_ms = 0;
            self.replicate_to_all();
        }

        // Rule 3: promotion round bookkeeping.
        membership::tick_promotion(self);
    }

    // ---- messages -----------------------------------------------------

    /// Dispatch an inbound protocol message (spec.md §4.4-§4.6).
    #[instrument(level = "trace", skip(self, message), fields(id = self.id, from))]
    pub fn on_message(&mut self, from: NodeId, message: Message) {
        if self.closed {
            return;
        }
        match message {
            Message::RequestVote(args) => vote::handle_request_vote(self, from, args),
            Message::RequestVoteResult(args) => vote::handle_request_vote_result(self, from, args),
            Message::AppendEntries(args) => append_entries::handle_append_entries(self, from, args),
            Message::AppendEntriesResult(args) => append_entries::handle_append_entries_result(self, from, args),
            Message::InstallSnapshot(args) => install_snapshot::handle_install_snapshot(self, from, args),
            Message::InstallSnapshotResult(args) => install_snapshot::handle_install_snapshot_result(self, from, args),
        }
    }

    fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.become_follower(term, None, Some(metrics::StepDownReason::HigherTerm));
            true
        } else {
            false
        }
    }

    // ---- replication send ----------------------------------------------

    fn broadcast_request_vote(&mut self) {
        let args = io::RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.last_log_term(),
        };
        let peers: Vec<NodeId> = self.configuration.voters().map(|s| s.id).filter(|id| *id != self.id).collect();
        for peer in peers {
            self.transport.send(peer, Message::RequestVote(args.clone()));
        }
    }

    fn replicate_to_all(&mut self) {
        let targets: Vec<NodeId> = self.configuration.all_ids().filter(|id| *id != self.id).collect();
        for target in targets {
            append_entries::send_append_entries(self, target);
        }
    }

    // ---- local log writes ----------------------------------------------

    /// Append an entry created locally (by the leader) and submit it for
    /// durable storage.
    fn append_local_entry(&mut self, entry_type: EntryType, payload: Vec<u8>) -> Arc<crate::log::Entry> {
        let entry = self.log.append(self.current_term, entry_type, payload);
        let ticket = self.next_ticket();
        self.pending.insert(ticket, PendingOp::LeaderAppend);
        self.storage.append_begin(ticket, std::slice::from_ref(&entry));
        entry
    }

    // ---- public API -----------------------------------------------------

    /// Submit a command to be replicated and, once committed, applied to
    /// the FSM. `callback` fires exactly once: with the FSM's result on
    /// commit, or an error if this node is not leader, is busy, or closes
    /// first.
    #[instrument(level = "debug", skip(self, payload, callback), fields(id = self.id))]
    pub fn apply_request(&mut self, payload: Vec<u8>, callback: ApplyCallback) {
        if !self.is_leader() {
            callback(Err(self.not_leader_error()));
            return;
        }
        let entry = self.append_local_entry(EntryType::Command, payload);
        if let Role::Leader(l) = &mut self.role {
            l.pending_applies.insert(entry.index, callback);
        }
        self.replicate_to_all();
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub fn add_server(&mut self, id: NodeId, address: String) -> RaftResult<()> {
        membership::add_server(self, id, address)
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub fn promote(&mut self, id: NodeId) -> RaftResult<()> {
        membership::promote(self, id)
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub fn remove_server(&mut self, id: NodeId) -> RaftResult<()> {
        membership::remove_server(self, id)
    }

    // ---- storage completions --------------------------------------------

    /// The embedder calls this once the append submitted under `ticket`
    /// has reached stable storage.
    #[instrument(level = "trace", skip(self, result), fields(id = self.id, ticket))]
    pub fn on_append_complete(&mut self, ticket: Ticket, result: RaftResult<()>) {
        let Some(op) = self.pending.remove(&ticket) else {
            return;
        };
        if let Err(err) = result {
            self.fatal(err);
            return;
        }
        match op {
            PendingOp::LeaderAppend => {
                apply::maybe_advance_commit(self);
            }
            PendingOp::FollowerAppend { leader_id, leader_commit } => {
                append_entries::finish_follower_append(self, leader_id, leader_commit);
            }
            PendingOp::FollowerTruncate | PendingOp::TakeSnapshot | PendingOp::InstallSnapshot { .. } | PendingOp::SnapshotGet { .. } => {}
        }
        self.report_metrics();
    }

    #[instrument(level = "trace", skip(self, result), fields(id = self.id, ticket))]
    pub fn on_truncate_complete(&mut self, ticket: Ticket, result: RaftResult<()>) {
        self.pending.remove(&ticket);
        if let Err(err) = result {
            self.fatal(err);
        }
    }

    #[instrument(level = "trace", skip(self, result), fields(id = self.id, ticket))]
    pub fn on_snapshot_put_complete(&mut self, ticket: Ticket, result: RaftResult<()>) {
        let Some(op) = self.pending.remove(&ticket) else {
            return;
        };
        self.snapshot.finish();
        if let Err(err) = result {
            self.fatal(err);
            return;
        }
        match op {
            PendingOp::TakeSnapshot => apply::finish_snapshot_shift(self),
            PendingOp::InstallSnapshot {
                leader_id,
                last_log_id,
                configuration,
                configuration_index,
            } => install_snapshot::finish_install(self, leader_id, last_log_id, configuration, configuration_index),
            _ => {}
        }
        self.report_metrics();
    }

    /// The embedder calls this once a snapshot fetch requested by
    /// `install_snapshot::send_install_snapshot` (because the bytes
    /// weren't already cached on the engine) has completed. Caches the
    /// bytes and retries the send now that they're available.
    #[instrument(level = "trace", skip(self, snapshot), fields(id = self.id, ticket))]
    pub fn on_snapshot_get_complete(&mut self, ticket: Ticket, snapshot: Option<io::Snapshot>) {
        let Some(PendingOp::SnapshotGet { target }) = self.pending.remove(&ticket) else {
            return;
        };
        let Some(snapshot) = snapshot else {
            return;
        };
        self.last_snapshot_bytes = Some(snapshot.data);
        install_snapshot::send_install_snapshot(self, target);
    }

    fn fatal(&mut self, err: RaftError) {
        warn!(id = self.id, error = %err, "fatal error, closing engine");
        self.close();
    }

    /// Quiesce the engine: fail all pending apply callbacks, release
    /// resources, transition to `Unavailable` (spec.md §5).
    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Role::Leader(l) = std::mem::replace(&mut self.role, Role::Unavailable) {
            for (_, cb) in l.pending_applies {
                cb(Err(RaftError::IoCanceled));
            }
        }
        self.report_metrics();
    }
}

/// Defensive check (opt-in via `Storage::defensive`, spec.md §0.6): the
/// entries a storage port hands back from `load()` must be contiguous and
/// strictly increasing starting right after the snapshot's last index (if
/// any), and no entry may duplicate or fall behind the snapshot boundary.
fn check_loaded_state_consistency(snapshot: &Option<io::SnapshotMeta>, entries: &[Arc<crate::log::Entry>]) -> RaftResult<()> {
    let floor = snapshot.as_ref().map(|s| s.last_log_id.index).unwrap_or(0);
    let mut expected = floor + 1;
    for entry in entries {
        if entry.index < expected {
            return Err(RaftError::BadState(format!(
                "loaded entry at index {} overlaps snapshot/prior entry boundary {}",
                entry.index, expected
            )));
        }
        if entry.index != expected {
            return Err(RaftError::BadState(format!(
                "loaded log is not contiguous: expected index {expected}, found {}",
                entry.index
            )));
        }
        expected += 1;
    }
    Ok(())
}
