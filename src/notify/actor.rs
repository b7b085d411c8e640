use crate::bus::types::Bus;
use crate::core::types::{Actor, PhaseEvent, SettlementEvent};
use crate::persistence::database::Database;
use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fan-out sink for phase and settlement events. Delivery is fire-and-forget
/// bookkeeping; nothing in the settlement path waits on it.
pub struct NotifierActor {
    bus: Bus,
    db: Database,
    shutdown: CancellationToken,
}

impl NotifierActor {
    pub fn new(bus: Bus, db: Database, shutdown: CancellationToken) -> Self {
        Self { bus, db, shutdown }
    }

    async fn notify_phase(&self, event: &PhaseEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                error!("NotifierActor: serializing phase event: {e}");
                return;
            }
        };
        if let Err(e) = self
            .db
            .insert_notification(event.poll_id, "phase_changed", &payload)
            .await
        {
            error!(poll = event.poll_id, "NotifierActor: insert failed: {e:#}");
        }
    }

    async fn notify_settlement(&self, event: &SettlementEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                error!("NotifierActor: serializing settlement event: {e}");
                return;
            }
        };
        if let Err(e) = self
            .db
            .insert_notification(event.poll_id, "settlement", &payload)
            .await
        {
            error!(poll = event.poll_id, "NotifierActor: insert failed: {e:#}");
        }
    }
}

#[async_trait::async_trait]
impl Actor for NotifierActor {
    async fn run(self) -> Result<()> {
        info!("NotifierActor started");

        let mut phase_rx = self.bus.phase_events.subscribe();
        let mut settlement_rx = self.bus.settlement_events.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("NotifierActor: shutdown requested");
                    break;
                }

                res = phase_rx.recv() => {
                    match res {
                        Ok(event) => self.notify_phase(&event).await,
                        Err(RecvError::Lagged(n)) => {
                            warn!("NotifierActor: lagged, dropped {n} phase events");
                        }
                        Err(RecvError::Closed) => {
                            warn!("NotifierActor: phase topic closed");
                            break;
                        }
                    }
                }

                res = settlement_rx.recv() => {
                    match res {
                        Ok(event) => self.notify_settlement(&event).await,
                        Err(RecvError::Lagged(n)) => {
                            warn!("NotifierActor: lagged, dropped {n} settlement events");
                        }
                        Err(RecvError::Closed) => {
                            warn!("NotifierActor: settlement topic closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("NotifierActor stopped cleanly");
        Ok(())
    }
}
