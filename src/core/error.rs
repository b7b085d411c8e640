use crate::core::types::{Phase, PollId};
use thiserror::Error;

/// Typed failures surfaced by the settlement engine. `InvalidPhase`,
/// `PermissionDenied` and `InvalidTransition` go straight back to the caller;
/// `DataIntegrity` aborts the whole settlement unit without partial writes.
#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("poll {poll} is in phase {actual:?}, action requires {required:?}")]
    InvalidPhase {
        poll: PollId,
        required: Phase,
        actual: Phase,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("cannot fast-forward poll {poll} from {from:?} to {to:?}")]
    InvalidTransition { poll: PollId, from: Phase, to: Phase },

    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// Covariance matrix stayed singular after bounded regularization. The
    /// prediction engine catches this internally and falls back to the
    /// unweighted mean; it never fails a whole poll run.
    #[error("covariance matrix singular after {attempts} regularization attempts")]
    NumericDegeneracy { attempts: u32 },
}
