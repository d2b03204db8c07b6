use crate::bus::{Event, EventBus};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// In-process implementation of [`EventBus`] backed by an unbounded
/// tokio channel. Delayed publishes are spawned onto the runtime and
/// delivered when the timer fires. Good enough for the worker binary and
/// integration tests; a real deployment plugs in its own transport.
pub struct LocalEventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl LocalEventBus {
    /// Create the bus and the receiving end a dispatcher drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: Event, delay: Option<Duration>) -> Result<()> {
        match delay {
            Some(delay) if !delay.is_zero() => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Receiver gone means shutdown; nothing to deliver to.
                    let _ = tx.send(event);
                });
                Ok(())
            }
            _ => {
                self.tx
                    .send(event)
                    .map_err(|_| anyhow::anyhow!("event bus receiver dropped"))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_immediate_delivery() {
        let (bus, mut rx) = LocalEventBus::channel();
        bus.publish(
            Event {
                event_type: "ratio::tool_response".into(),
                body: json!({"process_id": "p1"}),
            },
            None,
        )
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "ratio::tool_response");
        assert_eq!(event.body["process_id"], "p1");
    }

    #[tokio::test]
    async fn test_delayed_delivery_ordering() {
        let (bus, mut rx) = LocalEventBus::channel();

        bus.publish(
            Event {
                event_type: "late".into(),
                body: json!({}),
            },
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        bus.publish(
            Event {
                event_type: "prompt".into(),
                body: json!({}),
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, "prompt");
        assert_eq!(rx.recv().await.unwrap().event_type, "late");
    }
}
