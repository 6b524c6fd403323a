//! The process-wide event bus.
//!
//! Emission is fire-and-forget from any task; handlers run on a single
//! bus-owned task and must not block. Subscribers registered after an
//! emission never see it.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CommissioningOpened,
    CommissioningClosed,
    Connected,
    Disconnected,
    ZoneConnected,
    ZoneDisconnected,
    DeviceRemoved,
    Error,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub device_id: String,
    pub zone_id: String,
    pub detail: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, device_id: &str, zone_id: &str) -> Self {
        Self {
            kind,
            device_id: device_id.to_string(),
            zone_id: zone_id.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handlers: Arc<RwLock<Vec<EventHandler>>> = Arc::new(RwLock::new(Vec::new()));

        let handlers_ = handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for handler in handlers_.read().iter() {
                    handler(&event);
                }
            }
        });

        Self { tx, handlers }
    }

    pub fn on_event(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    pub fn emit(&self, event: Event) {
        log::debug!(
            "event: kind={:?}, device={}, zone={}",
            event.kind,
            event.device_id,
            event.zone_id
        );

        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let bus = EventBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        bus.on_event(move |event| {
            let _ = tx_a.send(event.kind);
        });
        bus.on_event(move |event| {
            let _ = tx_b.send(event.kind);
        });

        bus.emit(Event::new(EventKind::ZoneConnected, "dev", "zone"));

        let received = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(EventKind::ZoneConnected));

        let received = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(EventKind::ZoneConnected));
    }

    #[tokio::test]
    async fn emission_order_is_preserved() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.on_event(move |event| {
            let _ = tx.send(event.kind);
        });

        bus.emit(Event::new(EventKind::CommissioningOpened, "", ""));
        bus.emit(Event::new(EventKind::CommissioningClosed, "", ""));

        assert_eq!(rx.recv().await, Some(EventKind::CommissioningOpened));
        assert_eq!(rx.recv().await, Some(EventKind::CommissioningClosed));
    }
}
