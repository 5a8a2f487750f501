//! A deterministic, single-threaded cluster simulator used by the
//! integration tests: in-memory `Storage`/`Transport`/`Fsm` ports wired to
//! `RaftEngine`, a virtual clock, and the handful of network/node control
//! primitives the scenario tests need (isolate a node, drop a leader's
//! acks, install arbitrary persisted state before starting a node).
//!
//! There is no real time, no threads, and no tokio runtime here: the
//! fixture steps the cluster by jumping straight to whichever event is
//! soonest, either a message's delivery time or an engine's next timer
//! expiry, so a multi-second election timeout costs one `step()` call
//! rather than thousands.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tracing_subscriber::prelude::*;

use raftkit::config::Config;
use raftkit::error::RaftResult;
use raftkit::io::{self, Fsm, LoadedState, Message, Snapshot, Storage, Ticket, Transport};
use raftkit::log::{Entry, Log};
use raftkit::membership::Configuration;
use raftkit::metrics::{RaftMetrics, State as RaftState};
use raftkit::types::NodeId;
use raftkit::RaftEngine;

/// Initialize the tracing system once for the test process.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false).with_test_writer();
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

// ---- deterministic randomness --------------------------------------------

/// A thin wrapper around `rand`'s `StdRng`, seeded per engine so election
/// jitter and simulated link latency are reproducible given a fixed seed
/// (spec.md §5: "randomization uses the per-engine random source so test
/// fixtures can make them deterministic").
#[derive(Debug, Clone)]
struct Rng(rand::rngs::StdRng);

impl Rng {
    fn new(seed: u64) -> Self {
        use rand::SeedableRng;
        Self(rand::rngs::StdRng::seed_from_u64(seed))
    }

    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.0.next_u64()
    }

    fn range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if max <= min {
            min
        } else {
            self.0.gen_range(min..max)
        }
    }
}

// ---- simulated network ----------------------------------------------------

struct Envelope {
    from: NodeId,
    to: NodeId,
    message: Message,
    deliver_at: u64,
}

#[derive(Default)]
struct SimState {
    now: u64,
    mailbox: VecDeque<Envelope>,
    disconnected: HashSet<(NodeId, NodeId)>,
    /// While set, any `AppendEntriesResult` addressed to this node is
    /// dropped on delivery, starving its leader loop of contact acks
    /// without otherwise touching the network (used by `depose`).
    drop_acks_to: Option<NodeId>,
}

struct MemTransport {
    id: NodeId,
    sim: Rc<RefCell<SimState>>,
    rng: Rc<RefCell<Rng>>,
    min_latency: u64,
    max_latency: u64,
}

impl Transport for MemTransport {
    fn send(&mut self, target: NodeId, message: Message) {
        let mut sim = self.sim.borrow_mut();
        let pair = (self.id.min(target), self.id.max(target));
        if sim.disconnected.contains(&pair) {
            return;
        }
        let latency = self.rng.borrow_mut().range(self.min_latency, self.max_latency + 1);
        let deliver_at = sim.now + latency;
        sim.mailbox.push_back(Envelope { from: self.id, to: target, message, deliver_at });
    }
}

// ---- in-memory storage -----------------------------------------------------

enum Completion {
    Append(Ticket, RaftResult<()>),
    Truncate(Ticket, RaftResult<()>),
    SnapshotPut(Ticket, RaftResult<()>),
    SnapshotGet(Ticket, Option<Snapshot>),
}

#[derive(Default)]
struct StorageInner {
    term: u64,
    voted_for: Option<NodeId>,
    snapshot: Option<io::SnapshotMeta>,
    snapshot_data: Option<Arc<[u8]>>,
    entries: Vec<Arc<Entry>>,
    bootstrapped: bool,
}

#[derive(Clone)]
struct MemStorage {
    inner: Rc<RefCell<StorageInner>>,
    completions: Rc<RefCell<VecDeque<Completion>>>,
    sim: Rc<RefCell<SimState>>,
    rng: Rc<RefCell<Rng>>,
}

impl MemStorage {
    fn new(sim: Rc<RefCell<SimState>>, rng: Rc<RefCell<Rng>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StorageInner::default())),
            completions: Rc::new(RefCell::new(VecDeque::new())),
            sim,
            rng,
        }
    }

    /// Seed an arbitrary persisted log before the engine starts. Replaces
    /// whatever entries were there.
    fn seed_entries(&self, entries: Vec<Arc<Entry>>) {
        self.inner.borrow_mut().entries = entries;
        self.inner.borrow_mut().bootstrapped = true;
    }

    fn seed_term(&self, term: u64, voted_for: Option<NodeId>) {
        let mut inner = self.inner.borrow_mut();
        inner.term = term;
        inner.voted_for = voted_for;
    }

    fn seed_snapshot(&self, snapshot: Snapshot) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.retain(|e| e.index > snapshot.meta.last_log_id.index);
        inner.snapshot_data = Some(snapshot.data);
        inner.snapshot = Some(snapshot.meta);
        inner.bootstrapped = true;
    }

    fn persisted_entries(&self) -> Vec<Arc<Entry>> {
        self.inner.borrow().entries.clone()
    }

    fn persisted_term(&self) -> u64 {
        self.inner.borrow().term
    }
}

impl Storage for MemStorage {
    fn load(&mut self) -> RaftResult<LoadedState> {
        let inner = self.inner.borrow();
        Ok(LoadedState {
            current_term: inner.term,
            voted_for: inner.voted_for,
            snapshot: inner.snapshot.clone(),
            entries: inner.entries.clone(),
        })
    }

    fn bootstrap(&mut self, configuration: &Configuration) -> RaftResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.bootstrapped {
            return Err(raftkit::error::RaftError::BadState("already bootstrapped".into()));
        }
        let mut scratch = Log::new();
        scratch.append_configuration(1, configuration);
        inner.entries.push(scratch.get(1).expect("just appended"));
        inner.bootstrapped = true;
        Ok(())
    }

    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> RaftResult<()> {
        let mut inner = self.inner.borrow_mut();
        inner.term = term;
        inner.voted_for = voted_for;
        Ok(())
    }

    fn append_begin(&mut self, ticket: Ticket, entries: &[Arc<Entry>]) {
        let mut inner = self.inner.borrow_mut();
        if let Some(first) = entries.first() {
            inner.entries.retain(|e| e.index < first.index);
        }
        inner.entries.extend(entries.iter().cloned());
        drop(inner);
        self.completions.borrow_mut().push_back(Completion::Append(ticket, Ok(())));
    }

    fn truncate_begin(&mut self, ticket: Ticket, from_index: u64) {
        self.inner.borrow_mut().entries.retain(|e| e.index < from_index);
        self.completions.borrow_mut().push_back(Completion::Truncate(ticket, Ok(())));
    }

    fn snapshot_put_begin(&mut self, ticket: Ticket, snapshot: Snapshot) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.retain(|e| e.index > snapshot.meta.last_log_id.index);
        inner.snapshot_data = Some(snapshot.data);
        inner.snapshot = Some(snapshot.meta);
        drop(inner);
        self.completions.borrow_mut().push_back(Completion::SnapshotPut(ticket, Ok(())));
    }

    fn snapshot_get_begin(&mut self, ticket: Ticket) {
        let inner = self.inner.borrow();
        let snapshot = inner.snapshot.clone().map(|meta| Snapshot {
            meta,
            data: inner.snapshot_data.clone().unwrap_or_else(|| Arc::from(Vec::new().into_boxed_slice())),
        });
        drop(inner);
        self.completions.borrow_mut().push_back(Completion::SnapshotGet(ticket, snapshot));
    }

    fn time_ms(&self) -> u64 {
        self.sim.borrow().now
    }

    fn random(&mut self, min: u64, max: u64) -> u64 {
        self.rng.borrow_mut().range(min, max)
    }
}

// ---- in-memory state machine: a single running total --------------------

#[derive(Default)]
struct FsmInner {
    total: i64,
    applied: u64,
}

#[derive(Clone, Default)]
struct MemFsm {
    inner: Rc<RefCell<FsmInner>>,
}

impl MemFsm {
    fn total(&self) -> i64 {
        self.inner.borrow().total
    }

    fn applied(&self) -> u64 {
        self.inner.borrow().applied
    }
}

impl Fsm for MemFsm {
    fn apply(&mut self, payload: &[u8]) -> RaftResult<Vec<u8>> {
        let delta = i64::from_le_bytes(payload.try_into().unwrap_or([0; 8]));
        let mut inner = self.inner.borrow_mut();
        inner.total += delta;
        inner.applied += 1;
        Ok(inner.total.to_le_bytes().to_vec())
    }

    fn snapshot(&mut self) -> RaftResult<Arc<[u8]>> {
        Ok(Arc::from(self.inner.borrow().total.to_le_bytes().to_vec().into_boxed_slice()))
    }

    fn restore(&mut self, payload: &[u8]) -> RaftResult<()> {
        self.inner.borrow_mut().total = i64::from_le_bytes(payload.try_into().unwrap_or([0; 8]));
        Ok(())
    }
}

/// Encode a command that adds `delta` to the state machine's running total.
pub fn add(delta: i64) -> Vec<u8> {
    delta.to_le_bytes().to_vec()
}

// ---- the cluster fixture ---------------------------------------------------

type Engine = RaftEngine<MemStorage, MemTransport, MemFsm>;

struct Node {
    engine: Engine,
    storage: MemStorage,
    fsm: MemFsm,
    completions: Rc<RefCell<VecDeque<Completion>>>,
    alive: bool,
}

pub struct Builder {
    n: usize,
    config: Config,
    min_latency: u64,
    max_latency: u64,
    seed: u64,
}

impl Builder {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            config: Config::build("fixture").validate().expect("default fixture config is valid"),
            min_latency: 1,
            max_latency: 10,
            seed: 1,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn latency(mut self, min: u64, max: u64) -> Self {
        self.min_latency = min;
        self.max_latency = max;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Build `n` nodes, bootstrap each with the same `n`-voter initial
    /// configuration, and start them all immediately.
    pub fn build(self) -> Fixture {
        let mut fixture = self.build_unstarted();
        let ids: Vec<NodeId> = fixture.nodes.keys().copied().collect();
        for id in ids {
            fixture.bootstrap(id);
            fixture.start(id);
        }
        fixture
    }

    /// Build `n` nodes without bootstrapping or starting them, so a test
    /// can seed persisted state first via `Fixture::set_entries`/
    /// `set_term`/`set_snapshot`, then call `Fixture::start`.
    pub fn build_unstarted(self) -> Fixture {
        let sim = Rc::new(RefCell::new(SimState::default()));
        let mut seed_rng = Rng::new(self.seed);
        let mut configuration = Configuration::new_initial(1, "node-1");
        for id in 2..=self.n as NodeId {
            configuration = configuration.with_added_non_voter(id, format!("node-{id}")).expect("fresh id");
            configuration = configuration.with_promoted(id).expect("just added");
        }
        let mut nodes = BTreeMap::new();
        for id in 1..=self.n as NodeId {
            let rng = Rc::new(RefCell::new(Rng::new(seed_rng.next_u64())));
            let storage = MemStorage::new(sim.clone(), rng.clone());
            let transport = MemTransport {
                id,
                sim: sim.clone(),
                rng: rng.clone(),
                min_latency: self.min_latency,
                max_latency: self.max_latency,
            };
            let fsm = MemFsm::default();
            let engine = RaftEngine::new(id, format!("node-{id}"), self.config.clone(), storage.clone(), transport, fsm.clone());
            nodes.insert(
                id,
                Node {
                    engine,
                    storage,
                    fsm,
                    completions: Rc::new(RefCell::new(VecDeque::new())),
                    alive: true,
                },
            );
        }
        // Wire each node's storage completion queue to a handle the
        // fixture can drain after driving that node.
        for (_, node) in nodes.iter_mut() {
            node.completions = node.storage.completions.clone();
        }
        Fixture {
            sim,
            nodes,
            configuration,
            config: self.config.clone(),
            min_latency: self.min_latency,
            max_latency: self.max_latency,
            prev_stable_leader: None,
        }
    }
}

/// Leader identity/term/log shape observed on a previous step, kept to
/// check the Leader Append-Only property across steps: once a leader is
/// stable, its log at a later step must be the earlier log plus zero or
/// more appended entries, never a rewrite of an already-observed entry.
struct LeaderSnapshot {
    id: NodeId,
    term: u64,
    log: Vec<(u64, u64)>,
}

pub struct Fixture {
    sim: Rc<RefCell<SimState>>,
    nodes: BTreeMap<NodeId, Node>,
    configuration: Configuration,
    config: Config,
    min_latency: u64,
    max_latency: u64,
    prev_stable_leader: Option<LeaderSnapshot>,
}

impl Fixture {
    pub fn builder(n: usize) -> Builder {
        Builder::new(n)
    }

    pub fn new(n: usize) -> Self {
        Builder::new(n).build()
    }

    fn bootstrap(&mut self, id: NodeId) {
        let configuration = self.configuration.clone();
        let node = self.nodes.get_mut(&id).expect("known node");
        node.storage.bootstrap(&configuration).expect("bootstrap");
    }

    /// Start a node that was built via `build_unstarted` (optionally
    /// preceded by `set_entries`/`set_term`/`set_snapshot` calls).
    pub fn start(&mut self, id: NodeId) {
        let node = self.nodes.get_mut(&id).expect("known node");
        node.engine.load_and_start().expect("load_and_start");
        self.drain_completions(id);
    }

    /// Seed `id`'s persisted log before it starts. The entries are built
    /// against a scratch log so they carry the engine's real in-memory
    /// representation (sharing the `Log`'s own append/configuration
    /// helpers rather than hand-rolling an `Entry`).
    pub fn set_entries(&mut self, id: NodeId, build: impl FnOnce(&mut Log)) {
        let mut scratch = Log::new();
        build(&mut scratch);
        let mut entries = Vec::new();
        let mut idx = scratch.first_index().max(1);
        while idx <= scratch.last_index() {
            if let Some(e) = scratch.get(idx) {
                entries.push(e);
            }
            idx += 1;
        }
        self.nodes[&id].storage.seed_entries(entries);
    }

    pub fn set_term(&mut self, id: NodeId, term: u64, voted_for: Option<NodeId>) {
        self.nodes[&id].storage.seed_term(term, voted_for);
    }

    pub fn set_snapshot(&mut self, id: NodeId, snapshot: Snapshot) {
        self.nodes[&id].storage.seed_snapshot(snapshot);
    }

    // ---- node/network control -------------------------------------------

    /// Add a new, not-yet-started node to the cluster without touching its
    /// membership — a plain standalone engine a test can later add via
    /// `add_server`/`promote` on the leader.
    pub fn grow(&mut self, id: NodeId, seed: u64) {
        let rng = Rc::new(RefCell::new(Rng::new(seed)));
        let storage = MemStorage::new(self.sim.clone(), rng.clone());
        let transport = MemTransport {
            id,
            sim: self.sim.clone(),
            rng,
            min_latency: self.min_latency,
            max_latency: self.max_latency,
        };
        let fsm = MemFsm::default();
        let engine = RaftEngine::new(id, format!("node-{id}"), self.config.clone(), storage.clone(), transport, fsm.clone());
        let completions = storage.completions.clone();
        self.nodes.insert(
            id,
            Node {
                engine,
                storage,
                fsm,
                completions,
                alive: true,
            },
        );
        self.nodes.get_mut(&id).unwrap().engine.load_and_start().expect("load_and_start");
        self.drain_completions(id);
    }

    pub fn kill(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.engine.close();
            node.alive = false;
        }
    }

    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        self.sim.borrow_mut().disconnected.insert((a.min(b), a.max(b)));
    }

    pub fn reconnect(&mut self, a: NodeId, b: NodeId) {
        self.sim.borrow_mut().disconnected.remove(&(a.min(b), a.max(b)));
    }

    /// Drive `id`'s election timer past its bound before anyone else's,
    /// then step the cluster until it is acknowledged as stable leader (or
    /// `max_ms` of virtual time passes).
    pub fn elect(&mut self, id: NodeId, max_ms: u64) -> bool {
        {
            let node = self.nodes.get_mut(&id).expect("known node");
            node.engine.on_tick(100_000);
            self.drain_completions(id);
        }
        self.step_until(|f| f.leader() == Some(id), max_ms)
    }

    /// Cause the current leader to step down by starving it of follower
    /// acks until its own step-down rule fires (spec.md §4.2 leader tick
    /// rule 1).
    pub fn depose(&mut self, max_ms: u64) -> bool {
        let Some(leader) = self.leader() else { return false };
        self.sim.borrow_mut().drop_acks_to = Some(leader);
        let deposed = self.step_until(|f| f.leader() != Some(leader), max_ms);
        self.sim.borrow_mut().drop_acks_to = None;
        deposed
    }

    // ---- stepping ---------------------------------------------------------

    fn drain_completions(&mut self, id: NodeId) {
        loop {
            let next = {
                let node = match self.nodes.get(&id) {
                    Some(n) => n,
                    None => return,
                };
                node.completions.borrow_mut().pop_front()
            };
            let Some(completion) = next else { break };
            let node = self.nodes.get_mut(&id).expect("known node");
            match completion {
                Completion::Append(ticket, result) => node.engine.on_append_complete(ticket, result),
                Completion::Truncate(ticket, result) => node.engine.on_truncate_complete(ticket, result),
                Completion::SnapshotPut(ticket, result) => node.engine.on_snapshot_put_complete(ticket, result),
                Completion::SnapshotGet(ticket, snapshot) => node.engine.on_snapshot_get_complete(ticket, snapshot),
            }
        }
    }

    /// Advance the cluster by one event: deliver the earliest due message,
    /// or if none is due yet, jump straight to the nearest alive engine's
    /// next timer expiry and tick everyone by that delta.
    pub fn step(&mut self) -> bool {
        let next_deliver = self.sim.borrow().mailbox.iter().map(|e| e.deliver_at).min();
        let next_timer = self
            .nodes
            .values()
            .filter(|n| n.alive)
            .filter_map(|n| n.engine.next_timeout_ms())
            .min();

        let now = self.sim.borrow().now;
        let target = match (next_deliver, next_timer.map(|t| now + t)) {
            (Some(d), Some(t)) => d.min(t),
            (Some(d), None) => d,
            (None, Some(t)) => t,
            (None, None) => return false,
        };
        let delta = target.saturating_sub(now);
        self.sim.borrow_mut().now = target;

        // Deliver everything now due.
        loop {
            let due = {
                let sim = self.sim.borrow();
                sim.mailbox.iter().position(|e| e.deliver_at <= target)
            };
            let Some(pos) = due else { break };
            let envelope = self.sim.borrow_mut().mailbox.remove(pos).expect("position just found");
            if !matches!(self.nodes.get(&envelope.to), Some(n) if n.alive) {
                continue;
            }
            if self.sim.borrow().drop_acks_to == Some(envelope.to) && matches!(envelope.message, Message::AppendEntriesResult(_)) {
                continue;
            }
            let node = self.nodes.get_mut(&envelope.to).expect("alive node checked above");
            node.engine.on_message(envelope.from, envelope.message);
            self.drain_completions(envelope.to);
        }

        // Tick every alive engine by the delta just advanced.
        if delta > 0 {
            let ids: Vec<NodeId> = self.nodes.iter().filter(|(_, n)| n.alive).map(|(id, _)| *id).collect();
            for id in ids {
                self.nodes.get_mut(&id).unwrap().engine.on_tick(delta);
                self.drain_completions(id);
            }
        }

        self.check_leader_append_only();
        true
    }

    /// Step the cluster until `predicate` holds or `max_ms` of virtual
    /// time has elapsed since this call started.
    pub fn step_until(&mut self, mut predicate: impl FnMut(&Fixture) -> bool, max_ms: u64) -> bool {
        let deadline = self.sim.borrow().now + max_ms;
        loop {
            if predicate(self) {
                return true;
            }
            if self.sim.borrow().now >= deadline {
                return predicate(self);
            }
            if !self.step() {
                return predicate(self);
            }
        }
    }

    pub fn step_until_leader(&mut self, max_ms: u64) -> Option<NodeId> {
        self.step_until(|f| f.leader().is_some(), max_ms);
        self.leader()
    }

    pub fn step_until_commit(&mut self, index: u64, max_ms: u64) -> bool {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.step_until(move |f| ids.iter().all(|&id| !f.is_alive(id) || f.commit_index(id) >= index), max_ms)
    }

    pub fn step_until_applied(&mut self, id: NodeId, index: u64, max_ms: u64) -> bool {
        self.step_until(move |f| f.last_applied(id) >= index, max_ms)
    }

    // ---- accessors ----------------------------------------------------------

    /// The highest-term node that currently believes it is leader.
    pub fn leader(&self) -> Option<NodeId> {
        let mut best: Option<(u64, NodeId)> = None;
        for (&id, node) in &self.nodes {
            if !node.alive {
                continue;
            }
            let m = node.engine.metrics_receiver().borrow().clone();
            if m.state == RaftState::Leader {
                if best.map(|(t, _)| m.current_term > t).unwrap_or(true) {
                    best = Some((m.current_term, id));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    pub fn metrics(&self, id: NodeId) -> RaftMetrics {
        self.nodes[&id].engine.metrics_receiver().borrow().clone()
    }

    pub fn term(&self, id: NodeId) -> u64 {
        self.metrics(id).current_term
    }

    pub fn commit_index(&self, id: NodeId) -> u64 {
        self.metrics(id).commit_index
    }

    pub fn last_applied(&self, id: NodeId) -> u64 {
        self.metrics(id).last_applied
    }

    pub fn fsm_total(&self, id: NodeId) -> i64 {
        self.nodes[&id].fsm.total()
    }

    pub fn fsm_applied(&self, id: NodeId) -> u64 {
        self.nodes[&id].fsm.applied()
    }

    pub fn persisted_entry_count(&self, id: NodeId) -> usize {
        self.nodes[&id].storage.persisted_entries().len()
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|n| n.alive).unwrap_or(false)
    }

    /// Submit a command to `id` (which must currently be leader) and step
    /// the cluster until it commits or `max_ms` elapses, returning the
    /// FSM's result.
    pub fn apply(&mut self, id: NodeId, payload: Vec<u8>, max_ms: u64) -> RaftResult<Vec<u8>> {
        let result: Rc<RefCell<Option<RaftResult<Vec<u8>>>>> = Rc::new(RefCell::new(None));
        let result_cb = result.clone();
        {
            let node = self.nodes.get_mut(&id).expect("known node");
            node.engine.apply_request(payload, Box::new(move |r| *result_cb.borrow_mut() = Some(r)));
            self.drain_completions(id);
        }
        self.step_until(move |_| result.borrow().is_some(), max_ms);
        Rc::try_unwrap(result)
            .map(|r| r.into_inner())
            .unwrap_or(None)
            .unwrap_or_else(|| Err(raftkit::error::RaftError::Busy))
    }

    pub fn add_server(&mut self, leader: NodeId, id: NodeId, address: String) -> RaftResult<()> {
        let node = self.nodes.get_mut(&leader).expect("known node");
        let r = node.engine.add_server(id, address);
        self.drain_completions(leader);
        r
    }

    pub fn promote(&mut self, leader: NodeId, id: NodeId) -> RaftResult<()> {
        let node = self.nodes.get_mut(&leader).expect("known node");
        let r = node.engine.promote(id);
        self.drain_completions(leader);
        r
    }

    // ---- invariant checking -----------------------------------------------

    fn check_leader_append_only(&mut self) {
        let Some(id) = self.leader() else {
            self.prev_stable_leader = None;
            return;
        };
        let term = self.term(id);
        let log: Vec<(u64, u64)> = self.nodes[&id]
            .storage
            .persisted_entries()
            .iter()
            .map(|e| (e.index, e.term))
            .collect();
        if let Some(prev) = &self.prev_stable_leader {
            if prev.id == id && prev.term == term {
                assert!(
                    log.len() >= prev.log.len(),
                    "leader {id}'s log shrank from {} to {} entries while stable",
                    prev.log.len(),
                    log.len()
                );
                assert_eq!(
                    &log[..prev.log.len()],
                    &prev.log[..],
                    "leader {id} rewrote an already-observed log prefix"
                );
            }
        }
        self.prev_stable_leader = Some(LeaderSnapshot { id, term, log });
    }
}

