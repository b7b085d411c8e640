use crate::core::types::{
    CalendarRequest, Phase, Poll, PollId, PollKind, PollStatus, PredictionRun, Proposal,
    StatementId, TagId,
};
use crate::directory::provider::Directory;
use crate::engine::types::{
    AreaStatement, BallotItem, BallotSource, BallotValue, DelegateBallot, DirectBallot,
    PredictionSnapshot, PredictionOutcome, StatementRecord, VoteOutcome, VoteSnapshot,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::collections::HashMap;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                default_quorum SMALLINT NOT NULL DEFAULT 50,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                id BIGSERIAL PRIMARY KEY,
                group_id BIGINT NOT NULL REFERENCES groups(id),
                active BOOLEAN NOT NULL DEFAULT TRUE,
                can_vote BOOLEAN NOT NULL DEFAULT TRUE,
                poll_admin BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id BIGSERIAL PRIMARY KEY,
                group_id BIGINT NOT NULL REFERENCES groups(id),
                name TEXT NOT NULL,
                imac DOUBLE PRECISION,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id BIGSERIAL PRIMARY KEY,
                group_id BIGINT NOT NULL REFERENCES groups(id),
                kind SMALLINT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                start_at TIMESTAMPTZ NOT NULL,
                area_vote_end TIMESTAMPTZ NOT NULL,
                proposal_end TIMESTAMPTZ NOT NULL,
                prediction_statement_end TIMESTAMPTZ NOT NULL,
                prediction_bet_end TIMESTAMPTZ NOT NULL,
                delegate_vote_end TIMESTAMPTZ NOT NULL,
                end_at TIMESTAMPTZ NOT NULL,
                dynamic BOOLEAN NOT NULL DEFAULT FALSE,
                pinned_phase SMALLINT,
                quorum SMALLINT,
                status SMALLINT NOT NULL DEFAULT 0,
                settled BOOLEAN NOT NULL DEFAULT FALSE,
                prediction_run SMALLINT NOT NULL DEFAULT 0,
                participants BIGINT NOT NULL DEFAULT 0,
                tag_id BIGINT REFERENCES tags(id),
                observed_phase SMALLINT,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proposals (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                start_at TIMESTAMPTZ,
                end_at TIMESTAMPTZ,
                score BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One ballot per (poll, member); line items hang off it.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                member_id BIGINT NOT NULL REFERENCES members(id),
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (poll_id, member_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_items (
                id BIGSERIAL PRIMARY KEY,
                vote_id BIGINT NOT NULL REFERENCES votes(id),
                proposal_id BIGINT NOT NULL REFERENCES proposals(id),
                raw_score BIGINT,
                approval BOOLEAN,
                effective_score BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delegate_pools (
                id BIGSERIAL PRIMARY KEY,
                group_id BIGINT NOT NULL REFERENCES groups(id),
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delegate_subscriptions (
                pool_id BIGINT NOT NULL REFERENCES delegate_pools(id),
                member_id BIGINT NOT NULL REFERENCES members(id),
                tag_id BIGINT NOT NULL REFERENCES tags(id),
                PRIMARY KEY (pool_id, member_id, tag_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delegate_votes (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                pool_id BIGINT NOT NULL REFERENCES delegate_pools(id),
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (poll_id, pool_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delegate_vote_items (
                id BIGSERIAL PRIMARY KEY,
                delegate_vote_id BIGINT NOT NULL REFERENCES delegate_votes(id),
                proposal_id BIGINT NOT NULL REFERENCES proposals(id),
                raw_score BIGINT,
                approval BOOLEAN,
                effective_score BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_statements (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                end_at TIMESTAMPTZ NOT NULL,
                combined_bet DOUBLE PRECISION,
                outcome BOOLEAN,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_segments (
                id BIGSERIAL PRIMARY KEY,
                statement_id BIGINT NOT NULL REFERENCES prediction_statements(id),
                proposal_id BIGINT NOT NULL REFERENCES proposals(id),
                asserts_true BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_bets (
                statement_id BIGINT NOT NULL REFERENCES prediction_statements(id),
                member_id BIGINT NOT NULL REFERENCES members(id),
                score SMALLINT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (statement_id, member_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prediction_statement_votes (
                statement_id BIGINT NOT NULL REFERENCES prediction_statements(id),
                member_id BIGINT NOT NULL REFERENCES members(id),
                verdict BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (statement_id, member_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS area_statements (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                tag_id BIGINT NOT NULL REFERENCES tags(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS area_statement_votes (
                statement_id BIGINT NOT NULL REFERENCES area_statements(id),
                member_id BIGINT NOT NULL REFERENCES members(id),
                vote BOOLEAN NOT NULL,
                PRIMARY KEY (statement_id, member_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedule_events (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL REFERENCES polls(id),
                proposal_id BIGINT NOT NULL REFERENCES proposals(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                start_at TIMESTAMPTZ,
                end_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id BIGSERIAL PRIMARY KEY,
                poll_id BIGINT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
        )
        .fetch_all(&self.pool)
        .await?;

        info!(
            "Database tables initialized (Postgres). Found tables: {:?}",
            tables.iter().map(|t| &t.0).collect::<Vec<_>>()
        );
        Ok(())
    }

    // --- Poll loading ---

    pub async fn load_poll(&self, poll_id: PollId) -> Result<Poll> {
        let row = sqlx::query("SELECT * FROM polls WHERE id = $1")
            .bind(poll_id)
            .fetch_one(&self.pool)
            .await
            .context("loading poll")?;
        poll_from_row(&row)
    }

    /// Polls with any settlement work conceivably pending: not vote-settled,
    /// predictions not done, or the scheduler has not yet observed them in
    /// their final phase. Ranking polls are excluded outright; the engine
    /// never settles them, so they would pend forever. Each poll comes with
    /// the phase recorded at the last scheduler pass, if any.
    pub async fn fetch_open_polls(&self) -> Result<Vec<(Poll, Option<Phase>)>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM polls
            WHERE kind <> 2
              AND (settled = FALSE
               OR prediction_run <> 2
               OR observed_phase IS DISTINCT FROM 7)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let observed: Option<i16> = row.get("observed_phase");
                Ok((
                    poll_from_row(row)?,
                    observed.and_then(|i| Phase::from_index(i as usize)),
                ))
            })
            .collect()
    }

    pub async fn record_observed_phase(&self, poll_id: PollId, phase: Phase) -> Result<()> {
        sqlx::query("UPDATE polls SET observed_phase = $2 WHERE id = $1")
            .bind(poll_id)
            .bind(phase.index() as i16)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_pinned_phase(&self, poll_id: PollId, phase: Phase) -> Result<()> {
        sqlx::query("UPDATE polls SET pinned_phase = $2 WHERE id = $1")
            .bind(poll_id)
            .bind(phase.index() as i16)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Area resolution ---

    pub async fn has_area_statements(&self, poll_id: PollId) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM area_statements WHERE poll_id = $1)")
            .bind(poll_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>(0))
    }

    pub async fn load_area_statements(&self, poll_id: PollId) -> Result<Vec<AreaStatement>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.poll_id, s.tag_id,
                   COUNT(*) FILTER (WHERE v.vote) AS upvotes,
                   COUNT(*) FILTER (WHERE NOT v.vote) AS downvotes
            FROM area_statements s
            LEFT JOIN area_statement_votes v ON v.statement_id = s.id
            WHERE s.poll_id = $1
            GROUP BY s.id, s.poll_id, s.tag_id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| AreaStatement {
                id: row.get("id"),
                poll_id: row.get("poll_id"),
                tag: row.get("tag_id"),
                upvotes: row.get("upvotes"),
                downvotes: row.get("downvotes"),
            })
            .collect())
    }

    /// Assigns the resolved tag (when any) and discards every area statement
    /// and its votes, as one unit.
    pub async fn apply_area_result(&self, poll_id: PollId, tag: Option<TagId>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(tag) = tag {
            sqlx::query("UPDATE polls SET tag_id = $2 WHERE id = $1")
                .bind(poll_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            r#"
            DELETE FROM area_statement_votes
            WHERE statement_id IN (SELECT id FROM area_statements WHERE poll_id = $1)
            "#,
        )
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM area_statements WHERE poll_id = $1")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Vote settlement ---

    pub async fn load_vote_snapshot(
        &self,
        poll: &Poll,
        dir: &dyn Directory,
    ) -> Result<VoteSnapshot> {
        let proposal_rows = sqlx::query("SELECT * FROM proposals WHERE poll_id = $1")
            .bind(poll.id)
            .fetch_all(&self.pool)
            .await?;
        let proposals: Vec<Proposal> = proposal_rows
            .iter()
            .map(|row| Proposal {
                id: row.get("id"),
                poll_id: row.get("poll_id"),
                title: row.get("title"),
                description: row.get("description"),
                start: row.get("start_at"),
                end: row.get("end_at"),
                score: row.get("score"),
            })
            .collect();

        // Direct ballots and their line items.
        let vote_rows = sqlx::query("SELECT id, member_id FROM votes WHERE poll_id = $1")
            .bind(poll.id)
            .fetch_all(&self.pool)
            .await?;
        let mut direct: HashMap<i64, DirectBallot> = vote_rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                (
                    id,
                    DirectBallot {
                        voter: row.get("member_id"),
                        items: Vec::new(),
                    },
                )
            })
            .collect();
        let item_rows = sqlx::query(
            r#"
            SELECT i.vote_id, i.proposal_id, i.raw_score, i.approval
            FROM vote_items i
            JOIN votes v ON v.id = i.vote_id
            WHERE v.poll_id = $1
            "#,
        )
        .bind(poll.id)
        .fetch_all(&self.pool)
        .await?;
        for row in &item_rows {
            let vote_id: i64 = row.get("vote_id");
            if let Some(ballot) = direct.get_mut(&vote_id) {
                ballot.items.push(ballot_item(row)?);
            }
        }

        // Delegate ballots.
        let dvote_rows = sqlx::query("SELECT id, pool_id FROM delegate_votes WHERE poll_id = $1")
            .bind(poll.id)
            .fetch_all(&self.pool)
            .await?;
        let mut delegated: HashMap<i64, DelegateBallot> = dvote_rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                (
                    id,
                    DelegateBallot {
                        pool: row.get("pool_id"),
                        items: Vec::new(),
                    },
                )
            })
            .collect();
        let ditem_rows = sqlx::query(
            r#"
            SELECT i.delegate_vote_id, i.proposal_id, i.raw_score, i.approval
            FROM delegate_vote_items i
            JOIN delegate_votes v ON v.id = i.delegate_vote_id
            WHERE v.poll_id = $1
            "#,
        )
        .bind(poll.id)
        .fetch_all(&self.pool)
        .await?;
        for row in &ditem_rows {
            let vote_id: i64 = row.get("delegate_vote_id");
            if let Some(ballot) = delegated.get_mut(&vote_id) {
                ballot.items.push(ballot_item(row)?);
            }
        }

        // Membership facts come from the directory contract; only the pools
        // that actually cast a ballot matter here.
        let pool_ids: Vec<i64> = delegated.values().map(|b| b.pool).collect();
        let pools = dir.pool_delegators(&pool_ids).await?;
        let members = dir.group_members(poll.group_id).await?;
        let active_members = dir.active_member_count(poll.group_id).await?;
        let default_quorum = dir.default_quorum(poll.group_id).await?;

        Ok(VoteSnapshot {
            poll: poll.clone(),
            proposals,
            direct: direct.into_values().collect(),
            delegated: delegated.into_values().collect(),
            pools,
            members,
            active_members,
            default_quorum,
        })
    }

    /// Applies a vote settlement as one transaction. Returns false when the
    /// poll was settled concurrently (latch already set), in which case
    /// nothing is written and the caller must not repeat side effects.
    pub async fn apply_vote_outcome(&self, poll: &Poll, out: &VoteOutcome) -> Result<bool> {
        let start = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;

        let latched = sqlx::query(
            r#"
            UPDATE polls SET status = $2, participants = $3, settled = TRUE
            WHERE id = $1 AND settled = FALSE
            "#,
        )
        .bind(poll.id)
        .bind(out.status.as_i16())
        .bind(out.participants)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if latched == 0 {
            tx.rollback().await?;
            metrics::counter!("settlement_writes_total", "op" => "votes", "status" => "latched")
                .increment(1);
            return Ok(false);
        }

        for (proposal_id, score) in &out.scores {
            sqlx::query("UPDATE proposals SET score = $2 WHERE id = $1 AND poll_id = $3")
                .bind(proposal_id)
                .bind(score)
                .bind(poll.id)
                .execute(&mut *tx)
                .await?;
        }

        for eff in &out.effective {
            match eff.source {
                BallotSource::Direct(member) => {
                    sqlx::query(
                        r#"
                        UPDATE vote_items i SET effective_score = $4
                        FROM votes v
                        WHERE i.vote_id = v.id AND v.poll_id = $1 AND v.member_id = $2
                          AND i.proposal_id = $3
                        "#,
                    )
                    .bind(poll.id)
                    .bind(member)
                    .bind(eff.proposal_id)
                    .bind(eff.effective)
                    .execute(&mut *tx)
                    .await?;
                }
                BallotSource::Delegate(pool) => {
                    sqlx::query(
                        r#"
                        UPDATE delegate_vote_items i SET effective_score = $4
                        FROM delegate_votes v
                        WHERE i.delegate_vote_id = v.id AND v.poll_id = $1 AND v.pool_id = $2
                          AND i.proposal_id = $3
                        "#,
                    )
                    .bind(poll.id)
                    .bind(pool)
                    .bind(eff.proposal_id)
                    .bind(eff.effective)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        metrics::counter!("settlement_writes_total", "op" => "votes", "status" => "success")
            .increment(1);
        metrics::histogram!("settlement_write_duration_seconds", "op" => "votes")
            .record(start.elapsed().as_secs_f64());
        Ok(true)
    }

    // --- Prediction settlement ---

    pub async fn load_prediction_snapshot(
        &self,
        poll: &Poll,
        now: DateTime<Utc>,
    ) -> Result<PredictionSnapshot> {
        let current: Vec<StatementId> =
            sqlx::query("SELECT id FROM prediction_statements WHERE poll_id = $1")
                .bind(poll.id)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get("id"))
                .collect();

        // Comparison set: statements under the poll's tag that have ended,
        // plus the poll's own statements.
        let stmt_rows = sqlx::query(
            r#"
            SELECT s.id, s.poll_id, s.end_at, s.outcome
            FROM prediction_statements s
            JOIN polls p ON p.id = s.poll_id
            WHERE s.poll_id = $1
               OR ($2::BIGINT IS NOT NULL AND p.tag_id = $2 AND s.end_at <= $3)
            "#,
        )
        .bind(poll.id)
        .bind(poll.tag)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut statements: Vec<StatementRecord> = stmt_rows
            .iter()
            .map(|row| StatementRecord {
                id: row.get("id"),
                poll_id: row.get("poll_id"),
                end: row.get("end_at"),
                outcome: row.get("outcome"),
                bets: Default::default(),
            })
            .collect();

        let ids: Vec<StatementId> = statements.iter().map(|s| s.id).collect();
        let bet_rows = sqlx::query(
            "SELECT statement_id, member_id, score FROM prediction_bets WHERE statement_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let by_id: HashMap<StatementId, usize> = statements
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();
        for row in &bet_rows {
            let stmt: i64 = row.get("statement_id");
            let member: i64 = row.get("member_id");
            let score: i16 = row.get("score");
            if let Some(idx) = by_id.get(&stmt) {
                statements[*idx]
                    .bets
                    .insert(member, score.clamp(0, i16::from(u8::MAX)) as u8);
            }
        }

        Ok(PredictionSnapshot {
            poll: poll.clone(),
            current,
            statements,
        })
    }

    /// Transitions the prediction-run marker, but only from the expected
    /// state; a false return means another run owns the poll right now.
    pub async fn transition_prediction_run(
        &self,
        poll_id: PollId,
        from: PredictionRun,
        to: PredictionRun,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE polls SET prediction_run = $3 WHERE id = $1 AND prediction_run = $2",
        )
        .bind(poll_id)
        .bind(from.as_i16())
        .bind(to.as_i16())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn apply_prediction_outcome(
        &self,
        poll_id: PollId,
        out: &PredictionOutcome,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;
        for (statement_id, combined) in &out.combined {
            sqlx::query("UPDATE prediction_statements SET combined_bet = $2 WHERE id = $1")
                .bind(statement_id)
                .bind(combined)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE polls SET prediction_run = $2 WHERE id = $1")
            .bind(poll_id)
            .bind(PredictionRun::Done.as_i16())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        metrics::counter!("settlement_writes_total", "op" => "predictions", "status" => "success")
            .increment(1);
        metrics::histogram!("settlement_write_duration_seconds", "op" => "predictions")
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Community verdict ballots for every statement of a poll whose end date
    /// has passed, resolved or not.
    pub async fn load_statement_votes(
        &self,
        poll_id: PollId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(StatementId, Vec<bool>)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, v.verdict
            FROM prediction_statements s
            LEFT JOIN prediction_statement_votes v ON v.statement_id = s.id
            WHERE s.poll_id = $1 AND s.end_at <= $2
            ORDER BY s.id
            "#,
        )
        .bind(poll_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: Vec<(StatementId, Vec<bool>)> = Vec::new();
        for row in &rows {
            let id: i64 = row.get("id");
            let verdict: Option<bool> = row.get("verdict");
            match grouped.last_mut() {
                Some((last, votes)) if *last == id => {
                    if let Some(v) = verdict {
                        votes.push(v);
                    }
                }
                _ => grouped.push((id, verdict.into_iter().collect())),
            }
        }
        Ok(grouped)
    }

    pub async fn apply_statement_outcomes(
        &self,
        updates: &[(StatementId, Option<bool>)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (statement_id, outcome) in updates {
            sqlx::query("UPDATE prediction_statements SET outcome = $2 WHERE id = $1")
                .bind(statement_id)
                .bind(outcome)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- Tag accuracy ---

    pub async fn load_tag_statement_stats(
        &self,
        tag: TagId,
    ) -> Result<Vec<(Option<f64>, Option<bool>)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.combined_bet, s.outcome
            FROM prediction_statements s
            JOIN polls p ON p.id = s.poll_id
            WHERE p.tag_id = $1
            "#,
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("combined_bet"), row.get("outcome")))
            .collect())
    }

    pub async fn set_tag_imac(&self, tag: TagId, imac: Option<f64>) -> Result<()> {
        sqlx::query("UPDATE tags SET imac = $2 WHERE id = $1")
            .bind(tag)
            .bind(imac)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Collaborator sinks ---

    pub async fn insert_schedule_event(&self, req: &CalendarRequest) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO schedule_events (poll_id, proposal_id, title, description, start_at, end_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(req.poll_id)
        .bind(req.proposal_id)
        .bind(&req.title)
        .bind(&req.description)
        .bind(req.start)
        .bind(req.end)
        .fetch_one(&self.pool)
        .await;

        match &res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "schedule_events", "op" => "insert", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "schedule_events", "op" => "insert", "status" => "error").increment(1);
            }
        }
        Ok(res?.get("id"))
    }

    pub async fn insert_notification(
        &self,
        poll_id: PollId,
        kind: &str,
        payload: &str,
    ) -> Result<()> {
        let res = sqlx::query(
            "INSERT INTO notifications (poll_id, kind, payload) VALUES ($1, $2, $3)",
        )
        .bind(poll_id)
        .bind(kind)
        .bind(payload)
        .execute(&self.pool)
        .await;

        match &res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "notifications", "op" => "insert", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "notifications", "op" => "insert", "status" => "error").increment(1);
            }
        }
        res?;
        Ok(())
    }
}

fn ballot_item(row: &PgRow) -> Result<BallotItem> {
    let proposal_id: i64 = row.get("proposal_id");
    let raw: Option<i64> = row.get("raw_score");
    let approval: Option<bool> = row.get("approval");
    let value = match (raw, approval) {
        (Some(score), _) => BallotValue::Score(score),
        (None, Some(a)) => BallotValue::ForAgainst(a),
        (None, None) => anyhow::bail!(
            "vote item for proposal {} carries neither a score nor an approval",
            proposal_id
        ),
    };
    Ok(BallotItem { proposal_id, value })
}

fn poll_from_row(row: &PgRow) -> Result<Poll> {
    let kind_raw: i16 = row.get("kind");
    let kind = PollKind::from_i16(kind_raw)
        .with_context(|| format!("unknown poll kind {kind_raw}"))?;
    let pinned: Option<i16> = row.get("pinned_phase");
    let quorum: Option<i16> = row.get("quorum");
    Ok(Poll {
        id: row.get("id"),
        group_id: row.get("group_id"),
        kind,
        title: row.get("title"),
        description: row.get("description"),
        start: row.get("start_at"),
        area_vote_end: row.get("area_vote_end"),
        proposal_end: row.get("proposal_end"),
        prediction_statement_end: row.get("prediction_statement_end"),
        prediction_bet_end: row.get("prediction_bet_end"),
        delegate_vote_end: row.get("delegate_vote_end"),
        end: row.get("end_at"),
        dynamic: row.get("dynamic"),
        pinned_phase: pinned.and_then(|i| Phase::from_index(i as usize)),
        quorum: quorum.map(|q| q.clamp(0, 100) as u8),
        status: PollStatus::from_i16(row.get("status")),
        settled: row.get("settled"),
        prediction_run: PredictionRun::from_i16(row.get("prediction_run")),
        participants: row.get("participants"),
        tag: row.get("tag_id"),
    })
}
