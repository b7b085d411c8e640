use crate::core::error::EngineError;
use crate::core::types::{CalendarRequest, PollKind, PollStatus, Proposal};
use crate::engine::mandate::pool_mandates;
use crate::engine::types::{
    BallotSource, BallotValue, EffectiveScore, VoteOutcome, VoteSnapshot,
};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Settles the votes of one poll: delegate mandates, effective scoring,
/// proposal totals, quorum, and (for passing schedule polls) the calendar
/// request for the winning proposal.
///
/// Idempotent: returns `Ok(None)` when the poll is already settled. Any
/// referential or lookup failure is `DataIntegrity` and aborts the run with
/// nothing written; callers retry the whole settlement after fixing the data.
pub fn settle_votes(snap: &VoteSnapshot) -> Result<Option<VoteOutcome>, EngineError> {
    let poll = &snap.poll;
    if poll.settled {
        debug!(poll = poll.id, "vote settlement already performed, skipping");
        return Ok(None);
    }
    if poll.kind == PollKind::Ranking {
        return Err(EngineError::DataIntegrity(format!(
            "poll {}: ranking polls are not settled by this engine",
            poll.id
        )));
    }

    let proposals: BTreeMap<_, &Proposal> = snap.proposals.iter().map(|p| (p.id, p)).collect();
    for p in &snap.proposals {
        if p.poll_id != poll.id {
            return Err(EngineError::DataIntegrity(format!(
                "proposal {} belongs to poll {}, not poll {}",
                p.id, p.poll_id, poll.id
            )));
        }
    }

    // Exclusivity baseline: anyone who cast a direct ballot, permitted or not,
    // is out of every pool's mandate.
    let mut direct_voters = HashSet::new();
    for ballot in &snap.direct {
        if !direct_voters.insert(ballot.voter) {
            return Err(EngineError::DataIntegrity(format!(
                "member {} cast more than one direct ballot in poll {}",
                ballot.voter, poll.id
            )));
        }
    }

    let mandates = pool_mandates(&snap.pools, &snap.members, poll.tag, &direct_voters)?;

    let mut scores: BTreeMap<_, i64> = proposals.keys().map(|id| (*id, 0)).collect();
    let mut effective = Vec::new();

    // Direct ballots: raw score (Cardinal) or +/-1 (Schedule), counted only
    // for active voters holding vote permission.
    let mut counted_direct = 0i64;
    for ballot in &snap.direct {
        let profile = snap.members.get(&ballot.voter).ok_or_else(|| {
            EngineError::DataIntegrity(format!(
                "direct voter {} has no member profile",
                ballot.voter
            ))
        })?;
        if !profile.active || !profile.can_vote {
            continue;
        }
        counted_direct += 1;
        for item in &ballot.items {
            let value = item_value(poll.kind, item.value, item.proposal_id, poll.id)?;
            let score = scores.get_mut(&item.proposal_id).ok_or_else(|| {
                EngineError::DataIntegrity(format!(
                    "ballot references proposal {} outside poll {}",
                    item.proposal_id, poll.id
                ))
            })?;
            *score += value;
            effective.push(EffectiveScore {
                source: BallotSource::Direct(ballot.voter),
                proposal_id: item.proposal_id,
                effective: value,
            });
        }
    }

    // Delegate ballots: line items weighted by the pool's mandate.
    let mut acting_pools = HashSet::new();
    for ballot in &snap.delegated {
        if !acting_pools.insert(ballot.pool) {
            return Err(EngineError::DataIntegrity(format!(
                "pool {} cast more than one delegate ballot in poll {}",
                ballot.pool, poll.id
            )));
        }
        let mandate = *mandates.get(&ballot.pool).ok_or_else(|| {
            EngineError::DataIntegrity(format!(
                "delegate ballot from unknown pool {} in poll {}",
                ballot.pool, poll.id
            ))
        })?;
        for item in &ballot.items {
            let value = item_value(poll.kind, item.value, item.proposal_id, poll.id)? * mandate;
            let score = scores.get_mut(&item.proposal_id).ok_or_else(|| {
                EngineError::DataIntegrity(format!(
                    "delegate ballot references proposal {} outside poll {}",
                    item.proposal_id, poll.id
                ))
            })?;
            *score += value;
            effective.push(EffectiveScore {
                source: BallotSource::Delegate(ballot.pool),
                proposal_id: item.proposal_id,
                effective: value,
            });
        }
    }

    let delegated_weight: i64 = acting_pools
        .iter()
        .map(|pool| mandates.get(pool).copied().unwrap_or(0))
        .sum();
    let participants = counted_direct + delegated_weight;

    // Quorum as a percentage of active membership, compared exactly in integer
    // arithmetic: participants/total >= quorum/100.
    let quorum = poll.quorum.unwrap_or(snap.default_quorum);
    let status = if participants * 100 >= i64::from(quorum) * snap.active_members {
        PollStatus::Passed
    } else {
        PollStatus::FailedQuorum
    };

    let calendar = if poll.kind == PollKind::Schedule && status == PollStatus::Passed {
        winning_proposal(&snap.proposals, &scores).map(|winner| CalendarRequest {
            poll_id: poll.id,
            group_id: poll.group_id,
            proposal_id: winner.id,
            title: winner.title.clone(),
            description: winner.description.clone(),
            start: winner.start,
            end: winner.end,
        })
    } else {
        None
    };

    Ok(Some(VoteOutcome {
        scores,
        effective,
        mandates,
        participants,
        status,
        calendar,
    }))
}

fn item_value(
    kind: PollKind,
    value: BallotValue,
    proposal_id: i64,
    poll_id: i64,
) -> Result<i64, EngineError> {
    match (kind, value) {
        (PollKind::Cardinal, BallotValue::Score(s)) => Ok(s),
        (PollKind::Schedule, BallotValue::ForAgainst(true)) => Ok(1),
        (PollKind::Schedule, BallotValue::ForAgainst(false)) => Ok(-1),
        _ => Err(EngineError::DataIntegrity(format!(
            "ballot item for proposal {} does not match poll {} kind {:?}",
            proposal_id, poll_id, kind
        ))),
    }
}

/// Winner of a schedule poll: highest score, then earliest proposed start
/// (proposals without a start sort last), then lowest id.
fn winning_proposal<'a>(
    proposals: &'a [Proposal],
    scores: &BTreeMap<i64, i64>,
) -> Option<&'a Proposal> {
    proposals.iter().min_by(|a, b| {
        let sa = scores.get(&a.id).copied().unwrap_or(0);
        let sb = scores.get(&b.id).copied().unwrap_or(0);
        sb.cmp(&sa)
            .then_with(|| (a.start.is_none(), a.start).cmp(&(b.start.is_none(), b.start)))
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::tests::{poll_with_hours, ts};
    use crate::core::types::{MemberId, MemberProfile, Poll};
    use crate::engine::types::{BallotItem, DelegateBallot, DelegatePool, Delegator, DirectBallot};
    use std::collections::HashMap;

    fn member(id: MemberId) -> MemberProfile {
        MemberProfile {
            member_id: id,
            active: true,
            can_vote: true,
            poll_admin: false,
        }
    }

    fn proposal(id: i64, poll_id: i64) -> Proposal {
        Proposal {
            id,
            poll_id,
            title: format!("proposal {id}"),
            description: String::new(),
            start: None,
            end: None,
            score: 0,
        }
    }

    fn snapshot(poll: Poll, proposals: Vec<Proposal>) -> VoteSnapshot {
        VoteSnapshot {
            poll,
            proposals,
            direct: vec![],
            delegated: vec![],
            pools: vec![],
            members: HashMap::new(),
            active_members: 1,
            default_quorum: 0,
        }
    }

    fn score_items(entries: &[(i64, i64)]) -> Vec<BallotItem> {
        entries
            .iter()
            .map(|(p, s)| BallotItem {
                proposal_id: *p,
                value: BallotValue::Score(*s),
            })
            .collect()
    }

    #[test]
    fn cardinal_direct_scores_are_preserved() {
        // Voter scores (23, 980) on proposals (C, A); B untouched.
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let mut snap = snapshot(
            poll,
            vec![proposal(1, 1), proposal(2, 1), proposal(3, 1)], // A, B, C
        );
        snap.members.insert(10, member(10));
        snap.direct.push(DirectBallot {
            voter: 10,
            items: score_items(&[(3, 23), (1, 980)]),
        });

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.scores[&1], 980);
        assert_eq!(out.scores[&2], 0);
        assert_eq!(out.scores[&3], 23);
        assert_eq!(out.participants, 1);
        assert_eq!(out.status, PollStatus::Passed);
        assert!(out.calendar.is_none());
    }

    #[test]
    fn settled_poll_is_a_noop() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.settled = true;
        let snap = snapshot(poll, vec![proposal(1, 1)]);
        assert!(settle_votes(&snap).unwrap().is_none());
    }

    #[test]
    fn voter_without_permission_contributes_nothing() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let mut snap = snapshot(poll, vec![proposal(1, 1)]);
        snap.members.insert(10, member(10));
        snap.members.insert(11, {
            let mut m = member(11);
            m.can_vote = false;
            m
        });
        snap.direct.push(DirectBallot {
            voter: 10,
            items: score_items(&[(1, 5)]),
        });
        snap.direct.push(DirectBallot {
            voter: 11,
            items: score_items(&[(1, 1000)]),
        });

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.scores[&1], 5);
        assert_eq!(out.participants, 1);
        assert_eq!(out.effective.len(), 1);
    }

    #[test]
    fn delegate_items_multiply_by_mandate() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.tag = Some(5);
        let mut snap = snapshot(poll, vec![proposal(1, 1), proposal(2, 1)]);
        for id in 10..14 {
            snap.members.insert(id, member(id));
        }
        // Three delegators subscribed to the poll's tag; one of them (12) also
        // votes directly and must not count toward the mandate.
        snap.pools.push(DelegatePool {
            id: 100,
            delegators: [10, 11, 12]
                .into_iter()
                .map(|m| Delegator {
                    member: m,
                    tags: [5].into_iter().collect(),
                })
                .collect(),
        });
        snap.delegated.push(DelegateBallot {
            pool: 100,
            items: score_items(&[(1, 3), (2, -2)]),
        });
        snap.direct.push(DirectBallot {
            voter: 12,
            items: score_items(&[(1, 1)]),
        });
        snap.active_members = 4;

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.mandates[&100], 2);
        assert_eq!(out.scores[&1], 3 * 2 + 1);
        assert_eq!(out.scores[&2], -2 * 2);
        // One direct voter plus a mandate of two.
        assert_eq!(out.participants, 3);
    }

    #[test]
    fn schedule_poll_emits_single_calendar_request() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.kind = PollKind::Schedule;
        let mut proposals = vec![proposal(1, 1), proposal(2, 1), proposal(3, 1)];
        proposals[2].start = Some(ts(9));
        proposals[2].end = Some(ts(10));
        let mut snap = snapshot(poll, proposals);
        // 1 vote for proposal 1, 2 for proposal 2, 3 for proposal 3.
        let mut voter = 10;
        for (prop, count) in [(1i64, 1), (2, 2), (3, 3)] {
            for _ in 0..count {
                snap.members.insert(voter, member(voter));
                snap.direct.push(DirectBallot {
                    voter,
                    items: vec![BallotItem {
                        proposal_id: prop,
                        value: BallotValue::ForAgainst(true),
                    }],
                });
                voter += 1;
            }
        }
        snap.active_members = 6;

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.scores[&1], 1);
        assert_eq!(out.scores[&2], 2);
        assert_eq!(out.scores[&3], 3);
        assert_eq!(out.status, PollStatus::Passed);
        let cal = out.calendar.expect("winning schedule poll emits calendar");
        assert_eq!(cal.proposal_id, 3);
        assert_eq!(cal.start, Some(ts(9)));

        // Re-run after the latch is set: no second emission.
        let mut settled = snap.clone();
        settled.poll.settled = true;
        assert!(settle_votes(&settled).unwrap().is_none());
    }

    #[test]
    fn schedule_winner_tie_breaks_on_earliest_start() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.kind = PollKind::Schedule;
        let mut proposals = vec![proposal(1, 1), proposal(2, 1)];
        proposals[0].start = Some(ts(12));
        proposals[1].start = Some(ts(9));
        let mut snap = snapshot(poll, proposals);
        for (voter, prop) in [(10i64, 1i64), (11, 2)] {
            snap.members.insert(voter, member(voter));
            snap.direct.push(DirectBallot {
                voter,
                items: vec![BallotItem {
                    proposal_id: prop,
                    value: BallotValue::ForAgainst(true),
                }],
            });
        }
        snap.active_members = 2;

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.calendar.unwrap().proposal_id, 2);
    }

    #[test]
    fn failed_quorum_emits_no_calendar() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.kind = PollKind::Schedule;
        poll.quorum = Some(50);
        let mut snap = snapshot(poll, vec![proposal(1, 1)]);
        snap.members.insert(10, member(10));
        snap.direct.push(DirectBallot {
            voter: 10,
            items: vec![BallotItem {
                proposal_id: 1,
                value: BallotValue::ForAgainst(true),
            }],
        });
        snap.active_members = 10; // 1/10 participation < 50%

        let out = settle_votes(&snap).unwrap().unwrap();
        assert_eq!(out.status, PollStatus::FailedQuorum);
        assert!(out.calendar.is_none());
    }

    #[test]
    fn mismatched_ballot_kind_is_fatal() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]); // Cardinal
        let mut snap = snapshot(poll, vec![proposal(1, 1)]);
        snap.members.insert(10, member(10));
        snap.direct.push(DirectBallot {
            voter: 10,
            items: vec![BallotItem {
                proposal_id: 1,
                value: BallotValue::ForAgainst(true),
            }],
        });

        let err = settle_votes(&snap).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn foreign_proposal_reference_is_fatal() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let mut snap = snapshot(poll, vec![proposal(1, 1)]);
        snap.members.insert(10, member(10));
        snap.direct.push(DirectBallot {
            voter: 10,
            items: score_items(&[(99, 5)]),
        });

        let err = settle_votes(&snap).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }
}
