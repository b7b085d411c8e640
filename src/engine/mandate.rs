use crate::core::error::EngineError;
use crate::core::types::{MemberId, MemberProfile, PoolId, TagId};
use crate::engine::types::DelegatePool;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Mandate per delegate pool: the number of distinct delegators who are active,
/// hold vote permission, subscribed the pool to the poll's tag, and did not
/// cast a direct vote in this poll. Delegation is exclusive: a direct vote
/// removes the member from every pool's mandate.
///
/// A poll without a resolved tag yields zero mandates, since subscriptions are
/// per tag.
pub fn pool_mandates(
    pools: &[DelegatePool],
    members: &HashMap<MemberId, MemberProfile>,
    poll_tag: Option<TagId>,
    direct_voters: &HashSet<MemberId>,
) -> Result<BTreeMap<PoolId, i64>, EngineError> {
    let mut mandates = BTreeMap::new();

    for pool in pools {
        let mut mandate = 0i64;
        let mut seen: HashSet<MemberId> = HashSet::new();

        if let Some(tag) = poll_tag {
            for delegator in &pool.delegators {
                if !seen.insert(delegator.member) {
                    continue;
                }
                let profile = members.get(&delegator.member).ok_or_else(|| {
                    EngineError::DataIntegrity(format!(
                        "pool {}: delegator {} has no member profile",
                        pool.id, delegator.member
                    ))
                })?;
                if profile.active
                    && profile.can_vote
                    && delegator.tags.contains(&tag)
                    && !direct_voters.contains(&delegator.member)
                {
                    mandate += 1;
                }
            }
        }
        mandates.insert(pool.id, mandate);
    }

    Ok(mandates)
}
