use crate::core::types::{Phase, Poll};
use chrono::{DateTime, Utc};

/// Phase implied purely by the clock: the first interval whose end boundary is
/// still in the future; past the last boundary the poll is in Result.
pub fn clock_phase(poll: &Poll, now: DateTime<Utc>) -> Phase {
    for (phase, end) in poll.boundaries() {
        if now < end {
            return phase;
        }
    }
    Phase::Result
}

/// The poll's subjective current phase.
///
/// Dynamic polls: once an administrator has pinned a phase via fast-forward it
/// wins over the clock until the next fast-forward. Non-dynamic polls take the
/// later of clock and pin, so a fast-forward can only ever move forward and the
/// clock eventually catches up.
pub fn current_phase(poll: &Poll, now: DateTime<Utc>) -> Phase {
    match poll.pinned_phase {
        Some(pinned) if poll.dynamic => pinned,
        Some(pinned) => pinned.max(clock_phase(poll, now)),
        None => clock_phase(poll, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::tests::{poll_with_hours, ts};

    #[test]
    fn clock_walks_every_phase() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(clock_phase(&poll, ts(0)), Phase::Waiting);
        assert_eq!(clock_phase(&poll, ts(1)), Phase::AreaVote);
        assert_eq!(clock_phase(&poll, ts(2)), Phase::Proposal);
        assert_eq!(clock_phase(&poll, ts(3)), Phase::PredictionStatement);
        assert_eq!(clock_phase(&poll, ts(4)), Phase::PredictionBet);
        assert_eq!(clock_phase(&poll, ts(5)), Phase::DelegateVote);
        assert_eq!(clock_phase(&poll, ts(6)), Phase::Vote);
        assert_eq!(clock_phase(&poll, ts(7)), Phase::Result);
        assert_eq!(clock_phase(&poll, ts(23)), Phase::Result);
    }

    #[test]
    fn zero_length_phases_are_skipped() {
        // area_vote_end == proposal_end: the proposal phase never appears.
        let poll = poll_with_hours([1, 2, 2, 4, 5, 6, 7]);
        assert_eq!(clock_phase(&poll, ts(2)), Phase::PredictionStatement);
    }

    #[test]
    fn dynamic_pin_holds_past_deadline() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.dynamic = true;
        poll.pinned_phase = Some(Phase::Proposal);
        // Clock says Vote, the pin says Proposal, the pin wins.
        assert_eq!(current_phase(&poll, ts(6)), Phase::Proposal);
    }

    #[test]
    fn non_dynamic_pin_only_moves_forward() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.pinned_phase = Some(Phase::PredictionBet);
        // Pin ahead of the clock.
        assert_eq!(current_phase(&poll, ts(2)), Phase::PredictionBet);
        // Clock passed the pin; clock wins.
        assert_eq!(current_phase(&poll, ts(6)), Phase::Vote);
    }

    #[test]
    fn unpinned_dynamic_poll_follows_clock() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.dynamic = true;
        assert_eq!(current_phase(&poll, ts(3)), Phase::PredictionStatement);
    }
}
