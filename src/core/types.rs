use crate::core::error::EngineError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait Actor: Send + Sync + 'static {
    async fn run(self) -> Result<()>;
}

pub type GroupId = i64;
pub type PollId = i64;
pub type ProposalId = i64;
pub type MemberId = i64;
pub type PoolId = i64;
pub type StatementId = i64;
pub type TagId = i64;

/// Ordered poll phases. The window between prediction-bet end and vote end is
/// the delegate-vote window for Cardinal polls; for Schedule polls the same
/// window is the prediction community-vote window (same slot, different label).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Waiting,
    AreaVote,
    Proposal,
    PredictionStatement,
    PredictionBet,
    DelegateVote,
    Vote,
    Result,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Waiting,
        Phase::AreaVote,
        Phase::Proposal,
        Phase::PredictionStatement,
        Phase::PredictionBet,
        Phase::DelegateVote,
        Phase::Vote,
        Phase::Result,
    ];

    pub fn index(self) -> usize {
        Phase::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }

    pub fn from_index(i: usize) -> Option<Phase> {
        Phase::ALL.get(i).copied()
    }

    pub fn label(self, kind: PollKind) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::AreaVote => "area_vote",
            Phase::Proposal => "proposal",
            Phase::PredictionStatement => "prediction_statement",
            Phase::PredictionBet => "prediction_bet",
            Phase::DelegateVote => {
                if kind == PollKind::Cardinal {
                    "delegate_vote"
                } else {
                    "prediction_vote"
                }
            }
            Phase::Vote => "vote",
            Phase::Result => "result",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollKind {
    /// Signed integer scores per proposal.
    Cardinal,
    /// For/against ballots; a passing poll emits a calendar event for the winner.
    Schedule,
    /// Present in the data model, not handled by the settlement engine.
    Ranking,
}

impl PollKind {
    pub fn from_i16(v: i16) -> Option<PollKind> {
        match v {
            0 => Some(PollKind::Cardinal),
            1 => Some(PollKind::Schedule),
            2 => Some(PollKind::Ranking),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            PollKind::Cardinal => 0,
            PollKind::Schedule => 1,
            PollKind::Ranking => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStatus {
    Undecided,
    Passed,
    FailedQuorum,
}

impl PollStatus {
    pub fn from_i16(v: i16) -> PollStatus {
        match v {
            1 => PollStatus::Passed,
            -1 => PollStatus::FailedQuorum,
            _ => PollStatus::Undecided,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            PollStatus::Undecided => 0,
            PollStatus::Passed => 1,
            PollStatus::FailedQuorum => -1,
        }
    }
}

/// Marker set around a prediction settlement run so overlapping invocations
/// can detect each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionRun {
    NotStarted,
    Running,
    Done,
}

impl PredictionRun {
    pub fn from_i16(v: i16) -> PredictionRun {
        match v {
            1 => PredictionRun::Running,
            2 => PredictionRun::Done,
            _ => PredictionRun::NotStarted,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            PredictionRun::NotStarted => 0,
            PredictionRun::Running => 1,
            PredictionRun::Done => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub group_id: GroupId,
    pub kind: PollKind,
    pub title: String,
    pub description: String,
    // Phase boundaries, non-decreasing in this order.
    pub start: DateTime<Utc>,
    pub area_vote_end: DateTime<Utc>,
    pub proposal_end: DateTime<Utc>,
    pub prediction_statement_end: DateTime<Utc>,
    pub prediction_bet_end: DateTime<Utc>,
    pub delegate_vote_end: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// When set, the pinned phase holds until the next fast-forward instead of
    /// the clock advancing it.
    pub dynamic: bool,
    pub pinned_phase: Option<Phase>,
    /// Quorum percentage; falls back to the group default when absent.
    pub quorum: Option<u8>,
    pub status: PollStatus,
    /// Latch: vote settlement already performed. Guards re-entry and the
    /// one-shot calendar side effect.
    pub settled: bool,
    pub prediction_run: PredictionRun,
    pub participants: i64,
    pub tag: Option<TagId>,
}

impl Poll {
    /// Phase end boundaries in phase order. The phase belonging to each entry
    /// runs until its boundary; past the last one the poll is in Result.
    pub fn boundaries(&self) -> [(Phase, DateTime<Utc>); 7] {
        [
            (Phase::Waiting, self.start),
            (Phase::AreaVote, self.area_vote_end),
            (Phase::Proposal, self.proposal_end),
            (Phase::PredictionStatement, self.prediction_statement_end),
            (Phase::PredictionBet, self.prediction_bet_end),
            (Phase::DelegateVote, self.delegate_vote_end),
            (Phase::Vote, self.end),
        ]
    }

    /// Boundary timestamps must be non-decreasing in phase order. Violations
    /// are rejected at creation time.
    pub fn validate(&self) -> Result<(), EngineError> {
        let bounds = self.boundaries();
        for pair in bounds.windows(2) {
            if pair[1].1 < pair[0].1 {
                return Err(EngineError::DataIntegrity(format!(
                    "poll {}: {:?} boundary {} precedes {:?} boundary {}",
                    self.id, pair[1].0, pair[1].1, pair[0].0, pair[0].1
                )));
            }
        }
        if let Some(q) = self.quorum {
            if q > 100 {
                return Err(EngineError::DataIntegrity(format!(
                    "poll {}: quorum {}% out of range",
                    self.id, q
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub poll_id: PollId,
    pub title: String,
    pub description: String,
    // Schedule polls carry the proposed event window.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub score: i64,
}

/// Membership facts supplied by the directory collaborator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member_id: MemberId,
    pub active: bool,
    pub can_vote: bool,
    pub poll_admin: bool,
}

// ----------- Bus messages -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementJob {
    ResolveArea,
    SettleVotes,
    SettlePredictions,
    ResolveOutcomes,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub poll_id: PollId,
    pub job: SettlementJob,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub poll_id: PollId,
    pub group_id: GroupId,
    pub from: Option<Phase>,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub poll_id: PollId,
    pub group_id: GroupId,
    pub job: SettlementJob,
    pub status: PollStatus,
    pub at: DateTime<Utc>,
}

/// Creation request handed to the calendar collaborator when a schedule poll
/// passes. Emitted at most once per poll settlement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalendarRequest {
    pub poll_id: PollId,
    pub group_id: GroupId,
    pub proposal_id: ProposalId,
    pub title: String,
    pub description: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    pub(crate) fn poll_with_hours(hours: [u32; 7]) -> Poll {
        Poll {
            id: 1,
            group_id: 1,
            kind: PollKind::Cardinal,
            title: "t".into(),
            description: String::new(),
            start: ts(hours[0]),
            area_vote_end: ts(hours[1]),
            proposal_end: ts(hours[2]),
            prediction_statement_end: ts(hours[3]),
            prediction_bet_end: ts(hours[4]),
            delegate_vote_end: ts(hours[5]),
            end: ts(hours[6]),
            dynamic: false,
            pinned_phase: None,
            quorum: None,
            status: PollStatus::Undecided,
            settled: false,
            prediction_run: PredictionRun::NotStarted,
            participants: 0,
            tag: None,
        }
    }

    #[test]
    fn monotonic_boundaries_accepted() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        assert!(poll.validate().is_ok());
        // Equal boundaries are allowed (zero-length phases).
        let poll = poll_with_hours([1, 1, 3, 3, 5, 6, 7]);
        assert!(poll.validate().is_ok());
    }

    #[test]
    fn decreasing_boundary_rejected() {
        let poll = poll_with_hours([1, 2, 3, 5, 4, 6, 7]);
        match poll.validate() {
            Err(EngineError::DataIntegrity(_)) => {}
            other => panic!("expected DataIntegrity, got {:?}", other),
        }
    }

    #[test]
    fn phase_indices_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_index(phase.index()), Some(phase));
        }
        assert_eq!(Phase::from_index(8), None);
    }

    #[test]
    fn delegate_window_label_depends_on_kind() {
        assert_eq!(Phase::DelegateVote.label(PollKind::Cardinal), "delegate_vote");
        assert_eq!(Phase::DelegateVote.label(PollKind::Schedule), "prediction_vote");
    }
}
