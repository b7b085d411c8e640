use crate::core::error::EngineError;
use crate::core::types::PollId;
use crate::engine::types::AreaStatement;
use tracing::debug;

/// Picks the winning area statement for a poll: highest (upvotes - downvotes),
/// ties broken by lowest statement id so repeated runs agree. Returns None
/// when no area statement was proposed; the poll then stays untagged.
///
/// The caller assigns the winner's tag and discards all area statements and
/// their votes in the same transaction.
pub fn resolve_area(
    poll_id: PollId,
    statements: &[AreaStatement],
) -> Result<Option<&AreaStatement>, EngineError> {
    for s in statements {
        if s.poll_id != poll_id {
            return Err(EngineError::DataIntegrity(format!(
                "area statement {} belongs to poll {}, not poll {}",
                s.id, s.poll_id, poll_id
            )));
        }
    }
    let winner = statements
        .iter()
        .min_by(|a, b| b.net().cmp(&a.net()).then_with(|| a.id.cmp(&b.id)));
    if winner.is_none() {
        debug!(poll = poll_id, "no area statements, poll stays untagged");
    }
    Ok(winner)
}
