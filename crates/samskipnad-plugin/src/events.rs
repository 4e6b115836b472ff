//! In-process event bus exposed to plugins as the `event_bus` capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::capabilities::{CoreService, ServiceCall};
use crate::error::PluginError;
use crate::value::{Value, ValueMap};

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// An event published by a plugin (or by the host itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Plugin name, or `"host"` for host-originated events.
    pub source: String,
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(source: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus. Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn publish(&self, event: PluginEvent) -> usize {
        tracing::debug!(source = %event.source, event = %event.name, "event published");
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl CoreService for EventBus {
    async fn call(&self, call: ServiceCall<'_>) -> Result<Value, PluginError> {
        match call.method {
            "publish" => {
                let name = call
                    .params
                    .get("event")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        PluginError::Capability("publish requires a non-empty 'event'".into())
                    })?
                    .to_string();
                let payload = call
                    .params
                    .get("payload")
                    .cloned()
                    .unwrap_or_else(Value::empty_map);

                let delivered = self.publish(PluginEvent::new(call.plugin, name, payload));
                let mut result = ValueMap::new();
                result.insert("delivered".into(), delivered.into());
                Ok(Value::Map(result))
            }
            other => Err(PluginError::Capability(format!(
                "unknown event_bus method: {other}"
            ))),
        }
    }
}
