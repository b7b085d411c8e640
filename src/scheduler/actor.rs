use crate::bus::types::Bus;
use crate::config::config::SchedulerCfg;
use crate::core::types::{
    Actor, Phase, PhaseEvent, Poll, PollKind, PredictionRun, SettlementJob, SettlementRequest,
};
use crate::engine::clock::current_phase;
use crate::persistence::database::Database;
use anyhow::Result;
use chrono::Utc;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Scans open polls on an interval, publishing phase-changed events and the
/// settlement jobs that have come due. Stateless between ticks; the observed
/// phase lives on the poll row so a restart picks up where it left off.
pub struct SchedulerActor {
    bus: Bus,
    db: Database,
    cfg: SchedulerCfg,
    shutdown: CancellationToken,
}

impl SchedulerActor {
    pub fn new(bus: Bus, db: Database, cfg: SchedulerCfg, shutdown: CancellationToken) -> Self {
        Self {
            bus,
            db,
            cfg,
            shutdown,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn sweep(&self) -> Result<()> {
        let start = std::time::Instant::now();
        let now = Utc::now();
        let polls = self.db.fetch_open_polls().await?;
        let count = polls.len();

        let mut due = Vec::new();
        for (poll, observed) in polls {
            if let Err(e) = poll.validate() {
                error!(poll = poll.id, "skipping poll with broken boundaries: {e}");
                continue;
            }
            let phase = current_phase(&poll, now);

            if observed != Some(phase) {
                self.db.record_observed_phase(poll.id, phase).await?;
                self.bus
                    .phase_events
                    .publish(PhaseEvent {
                        poll_id: poll.id,
                        group_id: poll.group_id,
                        from: observed,
                        to: phase,
                        at: now,
                    })
                    .await?;
            }

            // Pending area resolutions are visible as surviving statement
            // rows; the rows are deleted once resolved.
            let area_pending = if phase > Phase::AreaVote {
                self.db.has_area_statements(poll.id).await.unwrap_or_else(|e| {
                    warn!(poll = poll.id, "area statement check failed: {e:#}");
                    false
                })
            } else {
                false
            };

            for job in due_jobs(&poll, phase, area_pending) {
                due.push(SettlementRequest {
                    poll_id: poll.id,
                    job,
                });
            }
        }

        // Bounded concurrency so a large backlog cannot blast the bus.
        let bus = self.bus.clone();
        let publish_futs = due.into_iter().map(move |req| {
            let bus = bus.clone();
            async move { bus.settlement_requests.publish(req).await }
        });
        let results = stream::iter(publish_futs)
            .buffer_unordered(32)
            .collect::<Vec<_>>()
            .await;
        for res in results {
            if let Err(e) = res {
                error!(?e, "SchedulerActor: publish to settlement_requests failed");
            }
        }

        metrics::counter!("scheduler_sweeps_total").increment(1);
        metrics::histogram!("scheduler_sweep_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        info!(polls = count, "scheduler sweep done");
        Ok(())
    }

}

/// Jobs due for one poll given its current phase. Ranking polls get nothing:
/// the engine does not settle them and repeatedly queueing the other jobs
/// would churn events forever.
fn due_jobs(poll: &Poll, phase: Phase, area_pending: bool) -> Vec<SettlementJob> {
    let mut jobs = Vec::new();

    if poll.kind == PollKind::Ranking {
        return jobs;
    }

    if phase > Phase::AreaVote && area_pending {
        jobs.push(SettlementJob::ResolveArea);
    }

    if phase == Phase::Result {
        // Statement verdicts are in once the community-vote window closes;
        // resolve them before predictions so the comparison set is fresh.
        jobs.push(SettlementJob::ResolveOutcomes);
        if poll.prediction_run == PredictionRun::NotStarted {
            jobs.push(SettlementJob::SettlePredictions);
        }
        if !poll.settled {
            jobs.push(SettlementJob::SettleVotes);
        }
    }

    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::tests::poll_with_hours;

    #[test]
    fn result_phase_queues_the_full_settlement_set() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            due_jobs(&poll, Phase::Result, false),
            vec![
                SettlementJob::ResolveOutcomes,
                SettlementJob::SettlePredictions,
                SettlementJob::SettleVotes,
            ]
        );
    }

    #[test]
    fn completed_work_is_not_requeued() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.settled = true;
        poll.prediction_run = PredictionRun::Done;
        assert_eq!(
            due_jobs(&poll, Phase::Result, false),
            vec![SettlementJob::ResolveOutcomes]
        );
    }

    #[test]
    fn pending_area_statements_queue_resolution_after_the_window() {
        let poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            due_jobs(&poll, Phase::Proposal, true),
            vec![SettlementJob::ResolveArea]
        );
        // Still inside the area vote: nothing to do yet.
        assert!(due_jobs(&poll, Phase::AreaVote, true).is_empty());
    }

    #[test]
    fn ranking_polls_are_never_queued() {
        let mut poll = poll_with_hours([1, 2, 3, 4, 5, 6, 7]);
        poll.kind = PollKind::Ranking;
        assert!(due_jobs(&poll, Phase::Result, true).is_empty());
        assert!(due_jobs(&poll, Phase::Proposal, true).is_empty());
    }
}

#[async_trait::async_trait]
impl Actor for SchedulerActor {
    async fn run(self) -> Result<()> {
        info!("SchedulerActor started");

        let mut tick = tokio::time::interval(self.cfg.tick);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("SchedulerActor: shutdown requested");
                    break;
                }

                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("SchedulerActor: sweep failed: {e:#}");
                    }
                }
            }
        }
        info!("SchedulerActor stopped cleanly");
        Ok(())
    }
}
