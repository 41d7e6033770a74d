//! MessagingManager: fan-in of every bot instance's adapter.

use crate::error::{MessagingError, Result};
use crate::messaging::traits::{Messaging, MessagingDyn};
use crate::orchestrator::ReplySink;
use crate::{ContextKey, InboundEvent, InstanceId, OutboundReply};

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::mpsc;

use std::collections::HashMap;
use std::sync::Arc;

/// Manages one adapter per bot instance.
pub struct MessagingManager {
    adapters: HashMap<InstanceId, Arc<dyn MessagingDyn>>,
}

impl MessagingManager {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register the adapter serving `instance`. Returns it for building a sink.
    pub fn register(
        &mut self,
        instance: InstanceId,
        adapter: impl Messaging,
    ) -> Arc<dyn MessagingDyn> {
        let adapter: Arc<dyn MessagingDyn> = Arc::new(adapter);
        self.adapters.insert(instance, adapter.clone());
        adapter
    }

    /// Start every adapter and merge their streams, tagging each event with
    /// the instance that received it. Adapters that fail to start are logged
    /// and skipped.
    pub async fn start_all(&self) -> mpsc::Receiver<(InstanceId, InboundEvent)> {
        let (tx, rx) = mpsc::channel(512);
        for (instance, adapter) in &self.adapters {
            match adapter.start().await {
                Ok(mut stream) => {
                    let tx = tx.clone();
                    let instance = instance.clone();
                    tokio::spawn(async move {
                        while let Some(event) = stream.next().await {
                            if tx.send((instance.clone(), event)).await.is_err() {
                                break;
                            }
                        }
                        tracing::info!(instance = %instance, "inbound stream ended");
                    });
                }
                Err(error) => {
                    tracing::error!(instance = %instance, adapter = adapter.name(), %error, "failed to start adapter");
                }
            }
        }
        rx
    }

    /// Send a reply through the adapter of `instance`.
    pub async fn respond(&self, instance: &str, key: &ContextKey, reply: OutboundReply) -> Result<()> {
        let adapter = self
            .adapters
            .get(instance)
            .ok_or_else(|| MessagingError::AdapterNotFound(instance.to_string()))?;
        adapter.respond(key, reply).await
    }

    /// Health of every adapter, keyed by instance.
    pub async fn health(&self) -> HashMap<InstanceId, std::result::Result<(), String>> {
        let mut health = HashMap::new();
        for (instance, adapter) in &self.adapters {
            let status = adapter.health_check().await.map_err(|error| error.to_string());
            health.insert(instance.clone(), status);
        }
        health
    }

    pub async fn shutdown_all(&self) {
        for (instance, adapter) in &self.adapters {
            if let Err(error) = adapter.shutdown().await {
                tracing::warn!(instance = %instance, %error, "adapter shutdown failed");
            }
        }
    }
}

impl Default for MessagingManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes an orchestrator's replies to one adapter.
pub struct AdapterSink(pub Arc<dyn MessagingDyn>);

#[async_trait]
impl ReplySink for AdapterSink {
    async fn send(&self, key: &ContextKey, reply: OutboundReply) -> Result<()> {
        self.0.respond(key, reply).await
    }
}
