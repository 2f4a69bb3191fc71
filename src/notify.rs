use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub: one channel per equipment for LISTEN, plus a firehose that
/// sees every event (delivery log, auditing).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to one equipment's events. Creates the channel if needed.
    pub fn subscribe(&self, equipment_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(equipment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Fan out an event. Never blocks; no-op when nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.firehose.send(event.clone());
        let equipment_id = event.equipment_id();
        let Some(sender) = self.channels.get(&equipment_id) else {
            return;
        };
        if sender.send(event.clone()).is_err() {
            // Every listener went away; drop the channel unless someone
            // re-subscribed in between.
            drop(sender);
            self.channels
                .remove_if(&equipment_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

pub fn channel_name(equipment_id: Ulid) -> String {
    format!("equipment_{equipment_id}")
}

/// What a listener receives on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub channel: String,
    pub event: &'static str,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn from_event(event: &Event) -> Self {
        // Events are externally tagged; the payload is the inner object.
        let payload = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .next()
                .map_or(serde_json::Value::Null, |(_, v)| v),
            Ok(other) => other,
            Err(_) => serde_json::Value::Null,
        };
        Self {
            channel: channel_name(event.equipment_id()),
            event: event.name(),
            payload,
        }
    }
}

/// Logs every dispatched event. Stands in for outbound delivery (mail, push).
pub async fn run_delivery_log(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => tracing::info!(
                event = event.name(),
                equipment = %event.equipment_id(),
                "notification dispatched"
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("delivery log lagged, skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
