//! AppendEntries: leader-side sending and follower-side receiving
//! (spec.md §4.3, §4.4).

use std::sync::Arc;

use tracing::{instrument, trace};

use crate::io::{AppendEntries, AppendEntriesResult, Fsm, Message, Storage, Transport};
use crate::log::EntryType;
use crate::membership::Configuration;
use crate::replication::ReplicationState;
use crate::types::NodeId;

use super::{FollowerState, PendingOp, RaftEngine, Role};

/// Build and send (or queue for send) an AppendEntries to `target`,
/// choosing between a full replication send and a heartbeat-only send per
/// spec.md §4.3 rule 1.
pub fn send_append_entries<S, T, F>(engine: &mut RaftEngine<S, T, F>, target: NodeId)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let now = engine.storage.time_ms();
    let stale_contact_ms = engine.config.stale_contact_ms;
    let Role::Leader(leader) = &engine.role else {
        return;
    };
    let is_stale = leader.replication.is_stale(target, now, stale_contact_ms);

    if is_stale {
        let args = AppendEntries {
            term: engine.current_term,
            leader_id: engine.id,
            prev_log_index: engine.log.last_index(),
            prev_log_term: engine.last_log_term(),
            entries: Vec::new(),
            leader_commit: engine.commit_index,
        };
        engine.transport.send(target, Message::AppendEntries(args));
        return;
    }

    let next_index = leader.replication.get(target).map(|p| p.next_index).unwrap_or(1);
    let (prev_index, prev_term) = if next_index <= 1 {
        (0, 0)
    } else {
        let prev_index = next_index - 1;
        (prev_index, engine.log.term_of(prev_index))
    };

    if next_index > 1 && prev_term == 0 && prev_index > engine.snapshot.last_log_id().index {
        // The entry immediately before `next_index` has been compacted
        // away but isn't covered by our snapshot either: shouldn't
        // happen, fall through to a snapshot send defensively.
        super::install_snapshot::send_install_snapshot(engine, target);
        return;
    }
    if next_index > 1 && prev_term == 0 {
        super::install_snapshot::send_install_snapshot(engine, target);
        return;
    }

    let acquired = engine.log.acquire(next_index);
    let entries: Vec<Arc<crate::log::Entry>> = acquired.as_slice().to_vec();
    let args = AppendEntries {
        term: engine.current_term,
        leader_id: engine.id,
        prev_log_index: prev_index,
        prev_log_term: prev_term,
        entries,
        leader_commit: engine.commit_index,
    };
    engine.log.release(acquired);
    trace!(target, next_index, "sending append entries");
    engine.transport.send(target, Message::AppendEntries(args));
}

#[instrument(level = "trace", skip(engine, args), fields(id = engine.id, from))]
pub fn handle_append_entries<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: AppendEntries)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    // 1. Stale term: reject.
    if args.term < engine.current_term {
        engine.transport.send(
            from,
            Message::AppendEntriesResult(AppendEntriesResult {
                term: engine.current_term,
                success: false,
                last_log_index: engine.log.last_index(),
            }),
        );
        return;
    }

    // 2 & 3. Observe term, convert to follower, record leader, reset timer.
    engine.observe_term(args.term);
    engine.role = Role::Follower(FollowerState {
        current_leader: Some((args.leader_id, String::new())),
    });
    engine.timer_ms = 0;
    engine.election_timeout_rand = engine.draw_election_timeout();

    // 4. Log-matching check.
    let local_prev_term = if args.prev_log_index == engine.snapshot.last_log_id().index {
        engine.snapshot.last_log_id().term
    } else {
        engine.log.term_of(args.prev_log_index)
    };
    let matches = args.prev_log_index == 0 || local_prev_term == args.prev_log_term;
    if !matches {
        if local_prev_term != 0 && args.prev_log_index <= engine.commit_index {
            engine.fatal(crate::error::RaftError::BadState(
                "append entries conflict at or below commit index".into(),
            ));
            return;
        }
        engine.transport.send(
            from,
            Message::AppendEntriesResult(AppendEntriesResult {
                term: engine.current_term,
                success: false,
                last_log_index: engine.log.last_index(),
            }),
        );
        return;
    }

    // 5. Conflict scan.
    let mut append_from_pos = 0usize;
    for (j, incoming) in args.entries.iter().enumerate() {
        let idx = args.prev_log_index + 1 + j as u64;
        let local = engine.log.term_of(idx);
        if local != 0 && local != incoming.term {
            if idx <= engine.commit_index {
                engine.fatal(crate::error::RaftError::BadState(
                    "append entries conflict at or below commit index".into(),
                ));
                return;
            }
            engine.configuration_uncommitted_index = 0;
            let truncate_ticket = engine.next_ticket();
            engine.pending.insert(truncate_ticket, PendingOp::FollowerTruncate);
            engine.storage.truncate_begin(truncate_ticket, idx);
            engine.log.truncate(idx);
            append_from_pos = j;
            break;
        }
        if local == incoming.term {
            append_from_pos = j + 1;
        }
    }

    // 6. Append the new tail and submit for durable storage.
    let tail = &args.entries[append_from_pos..];
    for e in tail {
        match e.entry_type {
            EntryType::Command => {
                engine.log.append(e.term, EntryType::Command, e.payload().to_vec());
            }
            EntryType::Configuration => {
                engine.log.append(e.term, EntryType::Configuration, e.payload().to_vec());
            }
            EntryType::Barrier => {
                engine.log.append_barrier(e.term);
            }
        }
    }
    let newly_appended: Vec<Arc<crate::log::Entry>> = tail
        .iter()
        .map(|e| engine.log.get(e.index).expect("just appended"))
        .collect();

    let ticket = engine.next_ticket();
    engine.pending.insert(
        ticket,
        PendingOp::FollowerAppend {
            leader_id: from,
            leader_commit: args.leader_commit,
        },
    );
    engine.storage.append_begin(ticket, &newly_appended);
}

/// Called once the follower's durable append for this batch has completed
/// (step 7 of spec.md §4.4).
pub fn finish_follower_append<S, T, F>(engine: &mut RaftEngine<S, T, F>, leader_id: NodeId, leader_commit: u64)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    // Pick up any configuration entries that just became durable.
    let mut idx = engine.configuration_index.max(1);
    while idx <= engine.log.last_index() {
        if let Some(e) = engine.log.get(idx) {
            if e.entry_type == EntryType::Configuration {
                if let Some(cfg) = e.as_configuration() {
                    engine.configuration = cfg;
                    if idx > engine.commit_index {
                        engine.configuration_uncommitted_index = idx;
                    }
                }
            }
        }
        idx += 1;
    }

    if leader_commit > engine.commit_index {
        engine.commit_index = leader_commit.min(engine.log.last_index());
        super::apply::advance_applied(engine);
    }

    engine.transport.send(
        leader_id,
        Message::AppendEntriesResult(AppendEntriesResult {
            term: engine.current_term,
            success: true,
            last_log_index: engine.log.last_index(),
        }),
    );
}

#[instrument(level = "trace", skip(engine, args), fields(id = engine.id, from))]
pub fn handle_append_entries_result<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: AppendEntriesResult)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if engine.observe_term(args.term) {
        return;
    }
    if !engine.is_leader() || args.term < engine.current_term {
        return;
    }
    let now = engine.storage.time_ms();
    let local_last_index = engine.log.last_index();

    if let Role::Leader(leader) = &mut engine.role {
        leader.replication.mark_contact(from, now);
        if args.success {
            let stale = leader
                .replication
                .get(from)
                .map(|p| args.last_log_index <= p.match_index)
                .unwrap_or(false);
            if !stale {
                leader.replication.record_success(from, args.last_log_index, now);
            }
        } else {
            leader.replication.record_mismatch(from, Some(args.last_log_index), local_last_index);
        }
    }

    if args.success {
        super::apply::maybe_advance_commit(engine);
        send_append_entries(engine, from);
    } else {
        send_append_entries(engine, from);
    }
}

/// Step down on self-removal, used by the membership/apply paths.
pub fn still_in_configuration<S, T, F>(engine: &RaftEngine<S, T, F>, configuration: &Configuration) -> bool
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    configuration.contains(engine.id)
}
