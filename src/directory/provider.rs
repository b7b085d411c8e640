use crate::core::types::{GroupId, MemberId, MemberProfile, PoolId};
use crate::engine::types::{DelegatePool, Delegator};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgPool;
use std::collections::HashMap;

/// Membership and permission facts. Settlement consumes this contract rather
/// than member tables directly, so a different backing store only has to
/// provide these five answers.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    async fn member_profile(
        &self,
        group: GroupId,
        member: MemberId,
    ) -> Result<Option<MemberProfile>>;

    async fn group_members(&self, group: GroupId) -> Result<HashMap<MemberId, MemberProfile>>;

    async fn active_member_count(&self, group: GroupId) -> Result<i64>;

    /// Group default quorum percentage, applied to polls without their own.
    async fn default_quorum(&self, group: GroupId) -> Result<u8>;

    /// The given pools with their delegators and tag subscriptions.
    async fn pool_delegators(&self, pools: &[PoolId]) -> Result<Vec<DelegatePool>>;
}

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn member_profile(
        &self,
        group: GroupId,
        member: MemberId,
    ) -> Result<Option<MemberProfile>> {
        let row = sqlx::query(
            "SELECT id, active, can_vote, poll_admin FROM members WHERE group_id = $1 AND id = $2",
        )
        .bind(group)
        .bind(member)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| MemberProfile {
            member_id: row.get("id"),
            active: row.get("active"),
            can_vote: row.get("can_vote"),
            poll_admin: row.get("poll_admin"),
        }))
    }

    async fn group_members(&self, group: GroupId) -> Result<HashMap<MemberId, MemberProfile>> {
        let rows = sqlx::query(
            "SELECT id, active, can_vote, poll_admin FROM members WHERE group_id = $1",
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                (
                    id,
                    MemberProfile {
                        member_id: id,
                        active: row.get("active"),
                        can_vote: row.get("can_vote"),
                        poll_admin: row.get("poll_admin"),
                    },
                )
            })
            .collect())
    }

    async fn active_member_count(&self, group: GroupId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM members WHERE group_id = $1 AND active")
            .bind(group)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn default_quorum(&self, group: GroupId) -> Result<u8> {
        let quorum: i16 = sqlx::query("SELECT default_quorum FROM groups WHERE id = $1")
            .bind(group)
            .fetch_one(&self.pool)
            .await
            .context("loading group default quorum")?
            .get("default_quorum");
        Ok(quorum.clamp(0, 100) as u8)
    }

    async fn pool_delegators(&self, pools: &[PoolId]) -> Result<Vec<DelegatePool>> {
        let mut out: HashMap<PoolId, DelegatePool> = pools
            .iter()
            .map(|id| {
                (
                    *id,
                    DelegatePool {
                        id: *id,
                        delegators: Vec::new(),
                    },
                )
            })
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT pool_id, member_id, tag_id
            FROM delegate_subscriptions
            WHERE pool_id = ANY($1)
            "#,
        )
        .bind(pools)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let pool_id: i64 = row.get("pool_id");
            let member: i64 = row.get("member_id");
            let tag: i64 = row.get("tag_id");
            if let Some(pool) = out.get_mut(&pool_id) {
                if let Some(d) = pool.delegators.iter_mut().find(|d| d.member == member) {
                    d.tags.insert(tag);
                } else {
                    pool.delegators.push(Delegator {
                        member,
                        tags: [tag].into_iter().collect(),
                    });
                }
            }
        }
        Ok(out.into_values().collect())
    }
}
