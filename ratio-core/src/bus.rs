use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// An opaque event on the bus: a type tag plus a JSON body.
#[derive(Clone, Debug)]
pub struct Event {
    pub event_type: String,
    pub body: Value,
}

impl Event {
    pub fn new<T: Serialize>(event_type: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self {
            event_type: event_type.into(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Deserialize the body into its expected shape.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// The event-bus collaborator: publish with at-least-once delivery and
/// an optional non-negative delay. Subscription is a deployment concern;
/// handlers are invoked by whatever dispatcher consumes the transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event, delay: Option<Duration>) -> Result<()>;
}
