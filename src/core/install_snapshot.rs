//! InstallSnapshot: leader-side sending and follower-side receiving
//! (spec.md §4.6).
//!
//! Unlike `async-raft`'s chunked streaming protocol, the abstract message
//! in spec.md §6 carries the entire snapshot payload in one message, so
//! there is no offset-tracking state machine here — just a single
//! request/response pair.

use tracing::instrument;

use crate::io::{Fsm, InstallSnapshot, InstallSnapshotResult, Message, Snapshot, Storage, Ticket, Transport};
use crate::types::{LogId, NodeId};

use super::{PendingOp, RaftEngine, Role};

/// Send (or queue a fetch for, then send) an InstallSnapshot to `target`.
///
/// The snapshot bytes are normally already cached on the engine (set by
/// `core::apply::finish_snapshot_shift` when this node took the snapshot
/// itself, or by `handle_install_snapshot`/`finish_install` when it was
/// installed from another leader). A freshly loaded engine that has never
/// taken or installed a snapshot in this process, though, only has the
/// metadata from `Storage::load` — so when the bytes aren't cached, fetch
/// them via `Storage::snapshot_get_begin` and retry the send from
/// `RaftEngine::on_snapshot_get_complete` once they arrive.
pub(crate) fn send_install_snapshot<S, T, F>(engine: &mut RaftEngine<S, T, F>, target: NodeId)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let Some(meta) = engine.snapshot.meta().cloned() else {
        // Nothing to send; fall back to a heartbeat so the follower at
        // least observes our term and commit index.
        return;
    };
    if let Role::Leader(leader) = &mut engine.role {
        leader.replication.set_state(target, crate::replication::ReplicationState::Snapshot);
    }
    let Some(data) = engine.last_snapshot_bytes.clone() else {
        let ticket: Ticket = engine.next_ticket();
        engine.pending.insert(ticket, PendingOp::SnapshotGet { target });
        engine.storage.snapshot_get_begin(ticket);
        return;
    };
    let args = InstallSnapshot {
        term: engine.current_term,
        leader_id: engine.id,
        last_index: meta.last_log_id.index,
        last_term: meta.last_log_id.term,
        conf_index: engine.configuration_index,
        configuration: meta.configuration.clone(),
        data,
    };
    engine.transport.send(target, Message::InstallSnapshot(args));
}

#[instrument(level = "debug", skip(engine, args), fields(id = engine.id, from))]
pub fn handle_install_snapshot<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: InstallSnapshot)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if args.term < engine.current_term {
        engine.transport.send(
            from,
            Message::InstallSnapshotResult(InstallSnapshotResult { term: engine.current_term }),
        );
        return;
    }
    engine.observe_term(args.term);

    if engine.snapshot.is_in_progress() {
        // Leader will retry once we're done.
        return;
    }

    if engine.snapshot.last_log_id().index >= args.last_index {
        engine.transport.send(
            from,
            Message::InstallSnapshotResult(InstallSnapshotResult { term: engine.current_term }),
        );
        return;
    }
    if engine.log.term_of(args.last_index) >= args.last_term && engine.log.term_of(args.last_index) != 0 {
        engine.transport.send(
            from,
            Message::InstallSnapshotResult(InstallSnapshotResult { term: engine.current_term }),
        );
        return;
    }

    engine.snapshot.begin();
    let last_index = args.last_index;
    engine.log.truncate(0);
    engine.log.set_offset(last_index);
    engine.last_snapshot_bytes = Some(args.data.clone());
    let last_log_id = LogId::new(args.last_term, last_index);

    let ticket = engine.next_ticket();
    engine.pending.insert(
        ticket,
        PendingOp::InstallSnapshot {
            leader_id: from,
            last_log_id,
            configuration: args.configuration.clone(),
            configuration_index: args.conf_index,
        },
    );
    engine.storage.snapshot_put_begin(
        ticket,
        Snapshot {
            meta: crate::io::SnapshotMeta {
                last_log_id,
                configuration: args.configuration,
            },
            data: args.data,
        },
    );
}

/// Called once the follower's durable persistence of an installed
/// snapshot has completed (spec.md §4.6 "on completion").
pub(crate) fn finish_install<S, T, F>(
    engine: &mut RaftEngine<S, T, F>,
    leader_id: NodeId,
    last_log_id: LogId,
    configuration: crate::membership::Configuration,
    configuration_index: u64,
) where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    engine.commit_index = engine.commit_index.max(last_log_id.index);
    engine.last_applied = last_log_id.index;
    engine.configuration = configuration.clone();
    engine.configuration_index = configuration_index;
    engine.configuration_uncommitted_index = 0;
    engine.snapshot.set(crate::io::SnapshotMeta {
        last_log_id,
        configuration,
    });
    if let Some(data) = engine.last_snapshot_bytes.clone() {
        if let Err(err) = engine.fsm.restore(&data) {
            engine.fatal(err);
            return;
        }
    }
    engine.transport.send(
        leader_id,
        Message::InstallSnapshotResult(InstallSnapshotResult { term: engine.current_term }),
    );
}

pub fn handle_install_snapshot_result<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: InstallSnapshotResult)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if engine.observe_term(args.term) {
        return;
    }
    if !engine.is_leader() {
        return;
    }
    if let Role::Leader(leader) = &mut engine.role {
        leader.replication.set_state(from, crate::replication::ReplicationState::Probe);
        if let Some(meta) = engine.snapshot.meta() {
            leader.replication.record_success(from, meta.last_log_id.index, engine.storage.time_ms());
        }
    }
    super::append_entries::send_append_entries(engine, from);
}
