//! Per-incident loop event channels

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;
use warden_types::{IncidentId, LoopEventEnvelope};

const DEFAULT_CAPACITY: usize = 256;

/// Publish/subscribe keyed by incident. Push-only: subscribers never send.
#[derive(Debug)]
pub struct LoopEventBus {
    channels: DashMap<IncidentId, broadcast::Sender<LoopEventEnvelope>>,
    capacity: usize,
}

impl Default for LoopEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LoopEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, incident_id: IncidentId) -> broadcast::Receiver<LoopEventEnvelope> {
        self.channels
            .entry(incident_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to current subscribers. Channels with no receivers left are dropped.
    pub fn publish(&self, envelope: LoopEventEnvelope) {
        let incident_id = envelope.incident_id;
        let delivered = match self.channels.get(&incident_id) {
            Some(sender) => sender.send(envelope).ok(),
            None => return,
        };

        match delivered {
            Some(receivers) => trace!(incident_id = %incident_id, receivers, "Loop event published"),
            None => {
                self.channels
                    .remove_if(&incident_id, |_, sender| sender.receiver_count() == 0);
            }
        }
    }

    pub fn subscriber_count(&self, incident_id: &IncidentId) -> usize {
        self.channels
            .get(incident_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::LoopEvent;

    #[tokio::test]
    async fn test_events_reach_only_their_incident() {
        let bus = LoopEventBus::default();
        let a = IncidentId::generate();
        let b = IncidentId::generate();
        let mut rx_a = bus.subscribe(a);
        let mut rx_b = bus.subscribe(b);

        bus.publish(LoopEventEnvelope::new(a, 1, LoopEvent::Completed));

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.incident_id, a);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = LoopEventBus::default();
        let id = IncidentId::generate();
        bus.publish(LoopEventEnvelope::new(id, 1, LoopEvent::Completed));
        assert_eq!(bus.subscriber_count(&id), 0);

        let rx = bus.subscribe(id);
        drop(rx);
        bus.publish(LoopEventEnvelope::new(id, 2, LoopEvent::Completed));
        assert_eq!(bus.subscriber_count(&id), 0);
    }
}
