use crate::bus::types::Bus;
use crate::config::config::PredictionCfg;
use crate::core::error::EngineError;
use crate::core::types::{
    Actor, Phase, Poll, PollId, PredictionRun, SettlementEvent, SettlementJob, SettlementRequest,
};
use crate::directory::provider::Directory;
use crate::engine::area::resolve_area;
use crate::engine::clock::current_phase;
use crate::engine::guard::check_phase;
use crate::engine::prediction::{resolve_outcome, settle_predictions, tag_imac};
use crate::engine::types::{PredictionOutcome, PredictionSnapshot};
use crate::engine::votes::settle_votes;
use crate::persistence::database::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Storage operations of one prediction settlement run: the run marker plus
/// snapshot and outcome. Split out so the marker discipline is testable
/// without Postgres.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn transition_run(
        &self,
        poll: PollId,
        from: PredictionRun,
        to: PredictionRun,
    ) -> Result<bool>;

    async fn load_snapshot(
        &self,
        poll: &Poll,
        now: DateTime<Utc>,
    ) -> Result<PredictionSnapshot>;

    /// Persists the combined bets and moves the run marker to Done.
    async fn apply_outcome(&self, poll: PollId, out: &PredictionOutcome) -> Result<()>;
}

#[async_trait]
impl PredictionStore for Database {
    async fn transition_run(
        &self,
        poll: PollId,
        from: PredictionRun,
        to: PredictionRun,
    ) -> Result<bool> {
        self.transition_prediction_run(poll, from, to).await
    }

    async fn load_snapshot(
        &self,
        poll: &Poll,
        now: DateTime<Utc>,
    ) -> Result<PredictionSnapshot> {
        self.load_prediction_snapshot(poll, now).await
    }

    async fn apply_outcome(&self, poll: PollId, out: &PredictionOutcome) -> Result<()> {
        self.apply_prediction_outcome(poll, out).await
    }
}

/// Prediction settlement under the run marker. Returns None when the marker
/// was not free. Every failure after the marker is taken — snapshot load,
/// engine run, outcome write — releases it back to NotStarted so a
/// republished request retries from scratch.
pub async fn run_prediction_settlement<S, R>(
    store: &S,
    poll: &Poll,
    cfg: &PredictionCfg,
    rng: &mut R,
) -> Result<Option<PredictionOutcome>>
where
    S: PredictionStore,
    R: Rng + Send,
{
    if !store
        .transition_run(poll.id, PredictionRun::NotStarted, PredictionRun::Running)
        .await?
    {
        return Ok(None);
    }

    let res = async {
        let snap = store.load_snapshot(poll, Utc::now()).await?;
        let out = settle_predictions(&snap, cfg, rng)?;
        store.apply_outcome(poll.id, &out).await?;
        Ok::<_, anyhow::Error>(out)
    }
    .await;

    match res {
        Ok(out) => Ok(Some(out)),
        Err(e) => {
            if !store
                .transition_run(poll.id, PredictionRun::Running, PredictionRun::NotStarted)
                .await?
            {
                warn!(poll = poll.id, "could not release prediction-run marker");
            }
            Err(e)
        }
    }
}

/// Area resolution deletes every area statement and its votes, so it must not
/// run while the area vote is still open.
fn check_area_closed(poll: &Poll, now: DateTime<Utc>) -> Result<(), EngineError> {
    let actual = current_phase(poll, now);
    if actual <= Phase::AreaVote {
        return Err(EngineError::InvalidPhase {
            poll: poll.id,
            required: Phase::Proposal,
            actual,
        });
    }
    Ok(())
}

/// Consumes settlement requests, runs the matching pure engine over a freshly
/// loaded snapshot and commits the results in one transaction. Requests are
/// retry-safe, so a failed run is recovered by republishing it.
pub struct SettlementActor<D: Directory> {
    bus: Bus,
    db: Database,
    directory: D,
    prediction_cfg: PredictionCfg,
    shutdown: CancellationToken,
}

impl<D: Directory> SettlementActor<D> {
    pub fn new(
        bus: Bus,
        db: Database,
        directory: D,
        prediction_cfg: PredictionCfg,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            db,
            directory,
            prediction_cfg,
            shutdown,
        }
    }

    #[tracing::instrument(skip(self), fields(poll = req.poll_id, job = ?req.job))]
    async fn handle(&self, req: SettlementRequest) -> Result<()> {
        let start = std::time::Instant::now();
        let poll = self.db.load_poll(req.poll_id).await?;
        poll.validate().context("poll failed validation")?;

        let res = match req.job {
            SettlementJob::ResolveArea => self.resolve_area(&poll).await,
            SettlementJob::SettleVotes => self.settle_votes(&poll).await,
            SettlementJob::SettlePredictions => self.settle_predictions(&poll).await,
            SettlementJob::ResolveOutcomes => self.resolve_outcomes(&poll).await,
        };

        let status = if res.is_ok() { "success" } else { "error" };
        metrics::counter!("settlement_runs_total", "job" => job_label(req.job), "status" => status)
            .increment(1);
        metrics::histogram!("settlement_run_duration_seconds", "job" => job_label(req.job))
            .record(start.elapsed().as_secs_f64());
        res
    }

    async fn resolve_area(&self, poll: &Poll) -> Result<()> {
        // A republished request while the area vote is still open must not
        // destroy live ballots.
        check_area_closed(poll, Utc::now())?;

        let statements = self.db.load_area_statements(poll.id).await?;
        let winner = resolve_area(poll.id, &statements)?;
        match winner {
            Some(stmt) => {
                info!(
                    poll = poll.id,
                    tag = stmt.tag,
                    net = stmt.net(),
                    "area resolved"
                );
                let tag = stmt.tag;
                self.db.apply_area_result(poll.id, Some(tag)).await?;
            }
            None => {
                info!(poll = poll.id, "no area statements, poll keeps no tag");
                self.db.apply_area_result(poll.id, None).await?;
            }
        }
        self.publish_event(poll, SettlementJob::ResolveArea).await
    }

    async fn settle_votes(&self, poll: &Poll) -> Result<()> {
        // Manually republished requests can arrive early; refuse them the
        // same way a member write would be refused.
        check_phase(poll, Utc::now(), Phase::Result, &[])?;

        let snap = self.db.load_vote_snapshot(poll, &self.directory).await?;
        let Some(out) = settle_votes(&snap)? else {
            debug!(poll = poll.id, "already settled, nothing to do");
            return Ok(());
        };

        // A concurrent run may have latched the poll between snapshot and
        // write; the calendar request must only go out when ours won.
        if !self.db.apply_vote_outcome(poll, &out).await? {
            debug!(poll = poll.id, "lost the settle race, skipping side effects");
            return Ok(());
        }

        info!(
            poll = poll.id,
            participants = out.participants,
            status = ?out.status,
            "votes settled"
        );
        if let Some(calendar) = out.calendar.clone() {
            self.bus.calendar_requests.publish(calendar).await?;
        }
        self.bus
            .settlement_events
            .publish(SettlementEvent {
                poll_id: poll.id,
                group_id: poll.group_id,
                job: SettlementJob::SettleVotes,
                status: out.status,
                at: Utc::now(),
            })
            .await
    }

    async fn settle_predictions(&self, poll: &Poll) -> Result<()> {
        check_phase(poll, Utc::now(), Phase::Result, &[])?;

        let mut rng = StdRng::from_entropy();
        let Some(out) =
            run_prediction_settlement(&self.db, poll, &self.prediction_cfg, &mut rng).await?
        else {
            info!(poll = poll.id, "prediction run already in progress or done");
            return Ok(());
        };

        if !out.degenerate.is_empty() {
            warn!(
                poll = poll.id,
                statements = ?out.degenerate,
                "singular covariance, settled via unweighted mean"
            );
        }
        info!(
            poll = poll.id,
            statements = out.combined.len(),
            "predictions settled"
        );

        self.refresh_tag_imac(poll).await?;
        self.publish_event(poll, SettlementJob::SettlePredictions)
            .await
    }

    async fn resolve_outcomes(&self, poll: &Poll) -> Result<()> {
        let now = Utc::now();
        let votes = self.db.load_statement_votes(poll.id, now).await?;
        let updates: Vec<_> = votes
            .iter()
            .map(|(id, verdicts)| (*id, resolve_outcome(verdicts)))
            .collect();
        if updates.is_empty() {
            return Ok(());
        }
        self.db.apply_statement_outcomes(&updates).await?;
        debug!(poll = poll.id, statements = updates.len(), "statement outcomes resolved");

        self.refresh_tag_imac(poll).await?;
        self.publish_event(poll, SettlementJob::ResolveOutcomes)
            .await
    }

    /// Tag accuracy depends on combined bets and outcomes, so both runs that
    /// touch those refresh it.
    async fn refresh_tag_imac(&self, poll: &Poll) -> Result<()> {
        let Some(tag) = poll.tag else { return Ok(()) };
        let stats = self.db.load_tag_statement_stats(tag).await?;
        let imac = tag_imac(&stats);
        self.db.set_tag_imac(tag, imac).await?;
        debug!(tag, ?imac, "tag accuracy refreshed");
        Ok(())
    }

    async fn publish_event(&self, poll: &Poll, job: SettlementJob) -> Result<()> {
        self.bus
            .settlement_events
            .publish(SettlementEvent {
                poll_id: poll.id,
                group_id: poll.group_id,
                job,
                status: poll.status,
                at: Utc::now(),
            })
            .await
    }
}

fn job_label(job: SettlementJob) -> &'static str {
    match job {
        SettlementJob::ResolveArea => "resolve_area",
        SettlementJob::SettleVotes => "settle_votes",
        SettlementJob::SettlePredictions => "settle_predictions",
        SettlementJob::ResolveOutcomes => "resolve_outcomes",
    }
}


#[async_trait::async_trait]
impl<D: Directory> Actor for SettlementActor<D> {
    async fn run(self) -> Result<()> {
        info!("SettlementActor started");

        let mut requests_rx = self.bus.settlement_requests.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("SettlementActor: shutdown requested");
                    break;
                }

                res = requests_rx.recv() => {
                    match res {
                        Ok(req) => {
                            if let Err(e) = self.handle(*req).await {
                                error!(poll = req.poll_id, job = ?req.job,
                                    "SettlementActor: run failed: {e:#}");
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // Jobs are rediscovered on the next scheduler sweep.
                            warn!("SettlementActor: lagged, dropped {n} requests");
                        }
                        Err(RecvError::Closed) => {
                            warn!("SettlementActor: request topic closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("SettlementActor stopped cleanly");
        Ok(())
    }
}
