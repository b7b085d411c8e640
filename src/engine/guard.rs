use crate::core::error::EngineError;
use crate::core::types::{MemberProfile, Phase, Poll, PollKind};
use crate::engine::clock::current_phase;
use chrono::{DateTime, Utc};

/// Closed set of alternates accepted by `check_phase` besides the required
/// phase: either another exact phase, or any phase as long as the poll has the
/// given kind (schedule polls accept proposals outside the proposal window).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseRequirement {
    Exact(Phase),
    OrKind(PollKind),
}

/// Gate for every member write: fails with `InvalidPhase` unless the poll is
/// currently in `required` or one of `alternates` matches.
pub fn check_phase(
    poll: &Poll,
    now: DateTime<Utc>,
    required: Phase,
    alternates: &[PhaseRequirement],
) -> Result<(), EngineError> {
    let actual = current_phase(poll, now);
    if actual == required {
        return Ok(());
    }
    for alt in alternates {
        match alt {
            PhaseRequirement::Exact(p) if *p == actual => return Ok(()),
            PhaseRequirement::OrKind(k) if *k == poll.kind => return Ok(()),
            _ => {}
        }
    }
    Err(EngineError::InvalidPhase {
        poll: poll.id,
        required,
        actual,
    })
}

/// Administrative fast-forward: pins the poll to `target`, which must strictly
/// follow the current phase. For dynamic polls the pin freezes clock-driven
/// advancement until the next fast-forward.
pub fn fast_forward(
    poll: &mut Poll,
    actor: &MemberProfile,
    target: Phase,
    now: DateTime<Utc>,
) -> Result<Phase, EngineError> {
    if !actor.poll_admin {
        return Err(EngineError::PermissionDenied(format!(
            "member {} is not a poll admin",
            actor.member_id
        )));
    }
    let from = current_phase(poll, now);
    if target <= from {
        return Err(EngineError::InvalidTransition {
            poll: poll.id,
            from,
            to: target,
        });
    }
    poll.pinned_phase = Some(target);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::tests::{poll_with_hours, ts};

    fn admin(id: i64) -> MemberProfile {
        MemberProfile {
            member_id: id,
            active: true,
            can_vote: true,
            poll_admin: true,
        }
    }

    #[test]
    fn check_phase_matches_required() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        assert!(check_phase(&poll, ts(2), Phase::Proposal, &[]).is_ok());
    }

    #[test]
    fn check_phase_rejects_outside_window() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let err = check_phase(&poll, ts(4), Phase::Proposal, &[]).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidPhase {
                poll: poll.id,
                required: Phase::Proposal,
                actual: Phase::PredictionBet,
            }
        );
    }

    #[test]
    fn schedule_kind_alternate_allows_late_proposals() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.kind = PollKind::Schedule;
        let alts = [PhaseRequirement::OrKind(PollKind::Schedule)];
        assert!(check_phase(&poll, ts(5), Phase::Proposal, &alts).is_ok());
        // Same alternate does nothing for a cardinal poll.
        poll.kind = PollKind::Cardinal;
        assert!(check_phase(&poll, ts(5), Phase::Proposal, &alts).is_err());
    }

    #[test]
    fn exact_alternate_accepts_second_phase() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let alts = [PhaseRequirement::Exact(Phase::PredictionBet)];
        assert!(check_phase(&poll, ts(4), Phase::PredictionStatement, &alts).is_ok());
    }

    #[test]
    fn fast_forward_requires_admin() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        let mut actor = admin(7);
        actor.poll_admin = false;
        let err = fast_forward(&mut poll, &actor, Phase::Vote, ts(2)).unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));
        assert_eq!(poll.pinned_phase, None);
    }

    #[test]
    fn fast_forward_must_move_strictly_forward() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        // Currently Proposal; same phase and earlier phases are rejected.
        for target in [Phase::Waiting, Phase::AreaVote, Phase::Proposal] {
            let err = fast_forward(&mut poll, &admin(7), target, ts(2)).unwrap_err();
            assert!(matches!(err, EngineError::InvalidTransition { .. }));
        }
        assert_eq!(
            fast_forward(&mut poll, &admin(7), Phase::PredictionBet, ts(2)).unwrap(),
            Phase::PredictionBet
        );
        assert_eq!(poll.pinned_phase, Some(Phase::PredictionBet));
    }

    #[test]
    fn fast_forward_pins_dynamic_poll() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.dynamic = true;
        fast_forward(&mut poll, &admin(7), Phase::Proposal, ts(1)).unwrap();
        // Pinned: the clock passing the proposal deadline no longer advances it.
        assert_eq!(current_phase(&poll, ts(6)), Phase::Proposal);
        // The next fast-forward starts from the pinned phase.
        fast_forward(&mut poll, &admin(7), Phase::Vote, ts(6)).unwrap();
        assert_eq!(current_phase(&poll, ts(6)), Phase::Vote);
    }
}
