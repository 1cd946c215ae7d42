//! Fan-out of poller output to stream subscribers.

use crate::sample::Sample;
use crate::tracking::TickTracking;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected,
    StatsUpdate {
        #[serde(flatten)]
        sample: Arc<Sample>,
        tracking: TickTracking,
    },
    TrackingComplete {
        data_points: usize,
    },
}

/// Bounded broadcast channel. A subscriber that falls behind loses the
/// oldest events and is told how many through `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Never blocks. Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: StreamEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tokio::sync::broadcast::error::RecvError;

    fn complete(n: usize) -> StreamEvent {
        StreamEvent::TrackingComplete { data_points: n }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(StreamEvent::Connected), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(complete(n));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert!(matches!(
            rx.recv().await,
            Ok(StreamEvent::TrackingComplete { data_points: 3 })
        ));
        assert!(matches!(
            rx.recv().await,
            Ok(StreamEvent::TrackingComplete { data_points: 4 })
        ));
    }

    #[test]
    fn stats_update_flattens_sample() {
        let mut sample = Sample::empty(SystemTime::UNIX_EPOCH);
        sample.cpu.usage_percent = 12.5;
        let event = StreamEvent::StatsUpdate {
            sample: Arc::new(sample),
            tracking: TickTracking {
                is_tracking: true,
                data_points: 7,
                progress: 2.3,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stats_update");
        assert_eq!(json["cpu"]["usage_percent"], 12.5);
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(json["tracking"]["data_points"], 7);
    }

    #[test]
    fn event_tags() {
        let json = serde_json::to_string(&StreamEvent::Connected).unwrap();
        assert_eq!(json, r#"{"event":"connected"}"#);
        let json = serde_json::to_string(&complete(300)).unwrap();
        assert_eq!(json, r#"{"event":"tracking_complete","data_points":300}"#);
    }
}
