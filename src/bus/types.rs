use crate::core::types::{
    CalendarRequest, PhaseEvent, SettlementEvent, SettlementRequest,
};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

// ---------- Topic trait (broadcast semantics) ----------
#[async_trait::async_trait]
pub trait Topic<T>: Sync + Send + 'static {
    /// Publish a message to all subscribers.
    async fn publish(&self, msg: T) -> Result<()>;

    /// Subscribe to the stream (each subscriber has an independent cursor).
    fn subscribe(&self) -> broadcast::Receiver<Arc<T>>;
}

// ---------- Concrete broadcast topic ----------
// 1->N fanout (lossy under lag). Payloads wrapped in Arc<T> to avoid Clone on T.
pub struct BroadcastTopic<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T: Clone + Send + Sync + 'static> BroadcastTopic<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(cap);
        Self { tx }
    }
}

#[async_trait]
impl<T: Debug + Clone + Send + Sync + 'static> Topic<T> for BroadcastTopic<T> {
    async fn publish(&self, msg: T) -> Result<()> {
        // Non-blocking; errors only when no receivers, which is fine for
        // fire-and-forget events.
        let _ = self.tx.send(Arc::new(msg));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct Bus {
    /// Settlement jobs due for a poll; the scheduler publishes, the settlement
    /// actor consumes. Manual recovery is a republish on the same topic.
    pub settlement_requests: Arc<dyn Topic<SettlementRequest>>,
    pub phase_events: Arc<dyn Topic<PhaseEvent>>,
    pub settlement_events: Arc<dyn Topic<SettlementEvent>>,
    pub calendar_requests: Arc<dyn Topic<CalendarRequest>>,
}

impl Bus {
    pub fn new() -> Self {
        let cap = 1024;

        Self {
            settlement_requests: Arc::new(BroadcastTopic::<SettlementRequest>::with_capacity(cap)),
            phase_events: Arc::new(BroadcastTopic::<PhaseEvent>::with_capacity(cap)),
            settlement_events: Arc::new(BroadcastTopic::<SettlementEvent>::with_capacity(cap)),
            calendar_requests: Arc::new(BroadcastTopic::<CalendarRequest>::with_capacity(cap)),
        }
    }
}
