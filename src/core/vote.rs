//! RequestVote receiver and candidate-side vote tallying (spec.md §4.5).

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::io::{Fsm, Message, RequestVote, RequestVoteResult, Storage, Transport};
use crate::types::NodeId;

use super::{RaftEngine, Role};

/// Candidate-role substate: one slot per voting server, true once granted.
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub votes: BTreeMap<NodeId, bool>,
}

impl<S, T, F> RaftEngine<S, T, F>
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    fn log_is_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        let (local_term, local_index) = (self.last_log_term(), self.log.last_index());
        (candidate_last_term, candidate_last_index) >= (local_term, local_index)
    }
}

#[instrument(level = "debug", skip(engine, args), fields(id = engine.id, from))]
pub fn handle_request_vote<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: RequestVote)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if args.term < engine.current_term {
        engine.transport.send(
            from,
            Message::RequestVoteResult(RequestVoteResult {
                term: engine.current_term,
                vote_granted: false,
            }),
        );
        return;
    }
    // Observing a higher term always precedes the grant decision.
    engine.observe_term(args.term);

    let eligible = engine.configuration.is_voter(engine.id)
        && (engine.voted_for.is_none() || engine.voted_for == Some(args.candidate_id));
    let up_to_date = engine.log_is_up_to_date(args.last_log_term, args.last_log_index);
    let grant = eligible && up_to_date;

    if grant {
        engine.voted_for = Some(args.candidate_id);
        if let Err(err) = engine.storage.save_term_and_vote(engine.current_term, engine.voted_for) {
            engine.fatal(err);
            return;
        }
        engine.timer_ms = 0;
        engine.election_timeout_rand = engine.draw_election_timeout();
        debug!(candidate = args.candidate_id, term = engine.current_term, "granting vote");
    }

    engine.transport.send(
        from,
        Message::RequestVoteResult(RequestVoteResult {
            term: engine.current_term,
            vote_granted: grant,
        }),
    );
    engine.report_metrics();
}

#[instrument(level = "debug", skip(engine, args), fields(id = engine.id, from))]
pub fn handle_request_vote_result<S, T, F>(engine: &mut RaftEngine<S, T, F>, from: NodeId, args: RequestVoteResult)
where
    S: Storage,
    T: Transport,
    F: Fsm,
{
    if engine.observe_term(args.term) {
        return;
    }
    if args.term < engine.current_term || !args.vote_granted {
        return;
    }
    let became_leader = if let Role::Candidate(c) = &mut engine.role {
        c.votes.insert(from, true);
        let granted = c.votes.values().filter(|v| **v).count();
        granted >= engine.configuration.quorum_size()
    } else {
        false
    };
    if became_leader {
        engine.become_leader();
    }
}
