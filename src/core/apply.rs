//! The commit/apply pipeline: advancing `commit_index` by the quorum
//! median, then driving the FSM forward to `commit_index` (spec.md §4.3
//! "Commit rule" and "Apply"), plus the snapshot trigger that follows it.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::io::{Fsm, Snapshot, SnapshotMeta, Storage, Ticket, Transport};
use crate::log::EntryType;
use crate::types::{LogId, NodeId};

use super::{PendingOp, RaftEngine, Role};

/// Recompute the leader's commit index from per-follower `match_index`
/// and, if it advanced, apply newly committed entries (spec.md §4.3
/// "Commit rule").
pub fn maybe_advance_commit<S, T, F>(engine: &mut RaftEngine<S, T, F>)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let Role::Leader(leader) = &engine.role else {
        return;
    };
    let voters: Vec<NodeId> = engine.configuration.voters().map(|s| s.id).collect();
    let leader_last_stored = engine.log.last_index();
    let candidate = leader.replication.commit_candidate(&voters, engine.id, leader_last_stored);

    if candidate <= engine.commit_index {
        return;
    }
    // Only commit entries from the current term (dissertation §5.4.2).
    if engine.log.term_of(candidate) != engine.current_term {
        return;
    }
    engine.commit_index = candidate;
    advance_applied(engine);
}

/// Apply every entry in `last_applied+1 ..= commit_index` to the FSM,
/// firing any pending apply-request callbacks and handling configuration
/// entries (spec.md §4.3 "Apply").
#[instrument(level = "debug", skip(engine), fields(id = engine.id))]
pub fn advance_applied<S, T, F>(engine: &mut RaftEngine<S, T, F>)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    while engine.last_applied < engine.commit_index {
        let index = engine.last_applied + 1;
        let Some(entry) = engine.log.get(index) else {
            // Compacted away by a snapshot that already covers this
            // index; the snapshot install path already advanced
            // `last_applied` to match.
            engine.last_applied = index;
            continue;
        };
        match entry.entry_type {
            EntryType::Command => {
                apply_command(engine, index);
            }
            EntryType::Barrier => {}
            EntryType::Configuration => {
                if let Some(cfg) = entry.as_configuration() {
                    engine.configuration = cfg;
                    engine.configuration_index = index;
                    if engine.configuration_uncommitted_index == index {
                        engine.configuration_uncommitted_index = 0;
                    }
                    if !engine.configuration.contains(engine.id) {
                        warn!(id = engine.id, "stepping down: removed from committed configuration");
                        engine.last_applied = index;
                        let term = engine.current_term;
                        engine.become_follower(term, None, Some(crate::metrics::StepDownReason::RemovedFromConfiguration));
                        return;
                    }
                }
            }
        }
        engine.last_applied = index;
    }
    maybe_take_snapshot(engine);
}

/// Apply a single command entry to the FSM and, if this node is leader and
/// a pending apply-request callback is registered for `index`, fire it
/// with the FSM's result.
fn apply_command<S, T, F>(engine: &mut RaftEngine<S, T, F>, index: u64)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let Some(entry) = engine.log.get(index) else {
        return;
    };
    let result = engine.fsm.apply(entry.payload());
    if let Role::Leader(leader) = &mut engine.role {
        if let Some(cb) = leader.pending_applies.remove(&index) {
            cb(result);
            return;
        }
    }
    if let Err(err) = result {
        warn!(id = engine.id, index, error = %err, "fsm apply failed");
    }
}

/// After applying, take a new snapshot if enough entries have accumulated
/// since the last one (spec.md §4.3, last paragraph).
fn maybe_take_snapshot<S, T, F>(engine: &mut RaftEngine<S, T, F>)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if !engine.snapshot.should_snapshot(engine.last_applied, engine.config.snapshot_threshold) {
        return;
    }
    let data: Arc<[u8]> = match engine.fsm.snapshot() {
        Ok(buf) => buf,
        Err(err) => {
            warn!(id = engine.id, error = %err, "fsm snapshot failed");
            return;
        }
    };
    engine.snapshot.begin();
    let meta = SnapshotMeta {
        last_log_id: LogId::new(engine.log.term_of(engine.last_applied), engine.last_applied),
        configuration: engine.configuration.clone(),
    };
    engine.pending_snapshot_meta = Some(meta.clone());
    engine.last_snapshot_bytes = Some(data.clone());
    let ticket: Ticket = engine.next_ticket();
    engine.pending.insert(ticket, PendingOp::TakeSnapshot);
    engine.storage.snapshot_put_begin(ticket, Snapshot { meta, data });
}

/// Called once the snapshot just taken (not installed — see
/// `core::install_snapshot`) has been durably persisted: install its
/// metadata and shift the log, keeping `snapshot_trailing` entries.
pub fn finish_snapshot_shift<S, T, F>(engine: &mut RaftEngine<S, T, F>)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let Some(meta) = engine.pending_snapshot_meta.take() else {
        return;
    };
    let keep_from = crate::snapshot::SnapshotState::shift_target(meta.last_log_id.index, engine.config.snapshot_trailing);
    engine.snapshot.set(meta);
    engine.log.shift(keep_from);
    info!(id = engine.id, kept_from = keep_from, "snapshot taken");
}
