use crate::bus::types::Bus;
use crate::core::types::Actor;
use crate::persistence::database::Database;
use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Records a calendar event for every passing schedule poll. The settlement
/// latch upstream guarantees at most one request per poll, so inserts here are
/// plain appends.
pub struct CalendarActor {
    bus: Bus,
    db: Database,
    shutdown: CancellationToken,
}

impl CalendarActor {
    pub fn new(bus: Bus, db: Database, shutdown: CancellationToken) -> Self {
        Self { bus, db, shutdown }
    }
}

#[async_trait::async_trait]
impl Actor for CalendarActor {
    async fn run(self) -> Result<()> {
        info!("CalendarActor started");

        let mut requests_rx = self.bus.calendar_requests.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("CalendarActor: shutdown requested");
                    break;
                }

                res = requests_rx.recv() => {
                    match res {
                        Ok(req) => {
                            match self.db.insert_schedule_event(&req).await {
                                Ok(event_id) => info!(
                                    poll = req.poll_id,
                                    proposal = req.proposal_id,
                                    event = event_id,
                                    "calendar event created"
                                ),
                                Err(e) => error!(
                                    poll = req.poll_id,
                                    "CalendarActor: insert failed: {e:#}"
                                ),
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("CalendarActor: lagged, dropped {n} requests");
                        }
                        Err(RecvError::Closed) => {
                            warn!("CalendarActor: request topic closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("CalendarActor stopped cleanly");
        Ok(())
    }
}
