//! One-at-a-time membership change: add/promote/remove, and the non-voter
//! catch-up rounds that gate promotion (spec.md §4.7).

use tracing::{debug, instrument, warn};

use crate::error::{RaftError, RaftResult};
use crate::io::{Fsm, Storage, Transport};
use crate::membership::Configuration;
use crate::types::NodeId;

use super::{LeaderState, PromoteState, RaftEngine, Role};

fn leader_mut<S, T, F>(engine: &mut RaftEngine<S, T, F>) -> RaftResult<&mut LeaderState>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    match &mut engine.role {
        Role::Leader(l) => Ok(l),
        _ => Err(engine.not_leader_error()),
    }
}

fn append_configuration_change<S, T, F>(engine: &mut RaftEngine<S, T, F>, configuration: Configuration)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let term = engine.current_term;
    let entry = engine.log.append_configuration(term, &configuration);
    engine.configuration = configuration;
    engine.configuration_uncommitted_index = entry.index;
    let ticket = engine.next_ticket();
    engine.pending.insert(ticket, super::PendingOp::LeaderAppend);
    engine.storage.append_begin(ticket, std::slice::from_ref(&entry));
    engine.replicate_to_all();
}

/// Append a configuration entry adding `id` as a non-voting member, then
/// begin its catch-up rounds (spec.md §4.7).
#[instrument(level = "debug", skip(engine), fields(id = engine.id, server = id))]
pub fn add_server<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId, address: String) -> RaftResult<()>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if !engine.is_leader() {
        return Err(engine.not_leader_error());
    }
    if engine.configuration_uncommitted_index != 0 {
        return Err(RaftError::Busy);
    }
    let Some(new_config) = engine.configuration.with_added_non_voter(id, address) else {
        return Err(RaftError::BadState(format!("server {id} already in configuration")));
    };
    let now = engine.storage.time_ms();
    let last_index = engine.log.last_index();
    append_configuration_change(engine, new_config);
    if let Role::Leader(leader) = &mut engine.role {
        leader.replication.add_member(id, last_index, now);
    }
    start_catch_up(engine, id)
}

/// Begin (or restart) catch-up rounds toward promoting `id` to voting.
/// Leader-only; `id` must already be a non-voting member of the active
/// configuration.
#[instrument(level = "debug", skip(engine), fields(id = engine.id, server = id))]
pub fn promote<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId) -> RaftResult<()>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if !engine.is_leader() {
        return Err(engine.not_leader_error());
    }
    if !engine.configuration.contains(id) || engine.configuration.is_voter(id) {
        return Err(RaftError::BadState(format!("server {id} is not a non-voting member")));
    }
    start_catch_up(engine, id)
}

fn start_catch_up<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId) -> RaftResult<()>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let already_promoting = matches!(&engine.role, Role::Leader(l) if l.promotee.is_some());
    if already_promoting {
        return Err(RaftError::Busy);
    }
    let now = engine.storage.time_ms();
    let last_index = engine.log.last_index();
    let leader = leader_mut(engine)?;
    leader.promotee = Some(PromoteState {
        id,
        round: 1,
        round_start_match: last_index,
        round_start_time: now,
        cumulative_duration_ms: 0,
    });
    debug!(id = engine.id, server = id, round = 1, target = last_index, "starting catch-up round");
    Ok(())
}

/// Append a configuration entry removing `id`. If `id` is this leader
/// itself, the step-down happens once the removal commits (spec.md §4.3's
/// apply rule, "if the leader is no longer in the committed
/// configuration, step down").
#[instrument(level = "debug", skip(engine), fields(id = engine.id, server = id))]
pub fn remove_server<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId) -> RaftResult<()>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if !engine.is_leader() {
        return Err(engine.not_leader_error());
    }
    if engine.configuration_uncommitted_index != 0 {
        return Err(RaftError::Busy);
    }
    let Some(new_config) = engine.configuration.with_removed(id) else {
        return Err(RaftError::BadState(format!("server {id} is not in the configuration")));
    };
    if let Role::Leader(leader) = &mut engine.role {
        if leader.promotee.as_ref().map(|p| p.id) == Some(id) {
            leader.promotee = None;
        }
        leader.replication.remove_member(id);
    }
    append_configuration_change(engine, new_config);
    Ok(())
}

/// Leader-tick rule 3: advance the in-flight promotion's round bookkeeping,
/// promoting or aborting as spec.md §4.2/§4.7 dictate.
pub(crate) fn tick_promotion<S, T, F>(engine: &mut RaftEngine<S, T, F>)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    let now = engine.storage.time_ms();
    let election_timeout = engine.election_timeout_rand.max(1);
    let max_rounds = engine.config.max_catch_up_rounds;
    let max_duration_ms = engine.config.max_catch_up_duration_ms;

    let snapshot = {
        let Role::Leader(leader) = &engine.role else { return };
        let Some(state) = &leader.promotee else { return };
        let match_index = leader.replication.get(state.id).map(|p| p.match_index).unwrap_or(0);
        (
            state.id,
            state.round,
            state.round_start_match,
            state.round_start_time,
            state.cumulative_duration_ms,
            match_index,
        )
    };
    let (id, round, round_start_match, round_start_time, cumulative, match_index) = snapshot;
    let round_elapsed = now.saturating_sub(round_start_time);

    if match_index < round_start_match {
        if round >= max_rounds && round_elapsed > election_timeout {
            abort_promotion(engine, id, "10th round exceeded election timeout");
        } else if cumulative + round_elapsed > max_duration_ms {
            abort_promotion(engine, id, "exceeded max catch-up duration");
        }
        return;
    }

    let last_index = engine.log.last_index();
    let more_to_replicate = last_index > round_start_match && round < max_rounds;
    if more_to_replicate {
        if let Role::Leader(leader) = &mut engine.role {
            if let Some(state) = &mut leader.promotee {
                state.round += 1;
                state.round_start_match = last_index;
                state.round_start_time = now;
                state.cumulative_duration_ms = cumulative + round_elapsed;
            }
        }
        debug!(id = engine.id, server = id, round = round + 1, target = last_index, "starting catch-up round");
        return;
    }

    if round <= max_rounds || round_elapsed < election_timeout {
        finish_promotion(engine, id);
    } else {
        abort_promotion(engine, id, "catch-up round exceeded election timeout after max rounds");
    }
}

fn finish_promotion<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if let Role::Leader(leader) = &mut engine.role {
        leader.promotee = None;
    }
    let Some(new_config) = engine.configuration.with_promoted(id) else {
        return;
    };
    if engine.configuration_uncommitted_index != 0 {
        // Another configuration change raced ahead of us (e.g. a
        // concurrent remove_server); let it settle before promoting.
        return;
    }
    debug!(id = engine.id, server = id, "catch-up complete, promoting to voter");
    append_configuration_change(engine, new_config);
}

fn abort_promotion<S, T, F>(engine: &mut RaftEngine<S, T, F>, id: NodeId, reason: &str)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    warn!(id = engine.id, server = id, reason, "aborting promotion");
    if let Role::Leader(leader) = &mut engine.role {
        leader.promotee = None;
    }
}
