//! In-process push channel for progress events.

use tokio::sync::broadcast;

use pcc_common::ControlEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of [`ControlEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ControlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ControlEvent::RunIteration {
            run_id: "r1".into(),
            iteration: 1,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ControlEvent::RunIteration {
                run_id: "r1".into(),
                iteration: 1
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(ControlEvent::MergeLockReleased {
            project_id: "p".into(),
            run_id: "r".into(),
        });
    }
}
