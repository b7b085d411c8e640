use crate::core::types::{
    CalendarRequest, MemberId, MemberProfile, Poll, PollId, PollStatus, PoolId, Proposal,
    ProposalId, StatementId, TagId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

// ----------- Vote aggregation inputs -----------------

/// One line item of a ballot. The value variant must match the poll kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum BallotValue {
    /// Cardinal: signed raw score chosen by the voter, preserved as-is.
    Score(i64),
    /// Schedule: for (+1) / against (-1).
    ForAgainst(bool),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BallotItem {
    pub proposal_id: ProposalId,
    pub value: BallotValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectBallot {
    pub voter: MemberId,
    pub items: Vec<BallotItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegateBallot {
    pub pool: PoolId,
    pub items: Vec<BallotItem>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delegator {
    pub member: MemberId,
    /// Tags this delegator has subscribed the pool to.
    pub tags: HashSet<TagId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegatePool {
    pub id: PoolId,
    pub delegators: Vec<Delegator>,
}

/// Everything `settle_votes` needs, loaded in one shot so the computation
/// itself stays pure.
#[derive(Clone, Debug)]
pub struct VoteSnapshot {
    pub poll: Poll,
    pub proposals: Vec<Proposal>,
    pub direct: Vec<DirectBallot>,
    pub delegated: Vec<DelegateBallot>,
    /// Pools that cast a delegate ballot in this poll.
    pub pools: Vec<DelegatePool>,
    pub members: HashMap<MemberId, MemberProfile>,
    /// Active membership of the owning group; quorum base.
    pub active_members: i64,
    /// Group default quorum percentage, used when the poll has none.
    pub default_quorum: u8,
}

// ----------- Vote aggregation outputs -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BallotSource {
    Direct(MemberId),
    Delegate(PoolId),
}

/// Effective (post-weighting) score for one ballot line item, written back to
/// the vote row by the settlement transaction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EffectiveScore {
    pub source: BallotSource,
    pub proposal_id: ProposalId,
    pub effective: i64,
}

#[derive(Clone, Debug)]
pub struct VoteOutcome {
    pub scores: BTreeMap<ProposalId, i64>,
    pub effective: Vec<EffectiveScore>,
    pub mandates: BTreeMap<PoolId, i64>,
    pub participants: i64,
    pub status: PollStatus,
    /// Present only for a passing schedule poll; the re-entry latch on the
    /// poll row keeps it one-shot.
    pub calendar: Option<CalendarRequest>,
}

// ----------- Prediction settlement -----------------

/// A prediction statement with its bets, as seen by the estimator. Statements
/// in the comparison set carry their resolved outcome where known.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatementRecord {
    pub id: StatementId,
    pub poll_id: PollId,
    pub end: DateTime<Utc>,
    pub outcome: Option<bool>,
    /// Raw bet score 0..=5 per member; normalized to [0,1] by /5 inside the
    /// estimator.
    pub bets: BTreeMap<MemberId, u8>,
}

#[derive(Clone, Debug)]
pub struct PredictionSnapshot {
    pub poll: Poll,
    /// Statements belonging to the poll being settled.
    pub current: Vec<StatementId>,
    /// Comparison set: statements under the poll's tag with an end date at or
    /// before now, plus the poll's own statements.
    pub statements: Vec<StatementRecord>,
}

#[derive(Clone, Debug, Default)]
pub struct PredictionOutcome {
    pub combined: BTreeMap<StatementId, f64>,
    /// Statements whose covariance stayed singular and settled via the
    /// unweighted-mean fallback.
    pub degenerate: Vec<StatementId>,
}

// ----------- Area resolution -----------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AreaStatement {
    pub id: StatementId,
    pub poll_id: PollId,
    pub tag: TagId,
    pub upvotes: i64,
    pub downvotes: i64,
}

impl AreaStatement {
    pub fn net(&self) -> i64 {
        self.upvotes - self.downvotes
    }
}
