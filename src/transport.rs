//! ==============================================================================
//! transport.rs - broker access
//! ==============================================================================
//!
//! purpose:
//!     one small interface for talking to the pub/sub broker, so the filter
//!     runs against a real mqtt broker (rumqttc) in production and against an
//!     in-memory recorder in tests.
//!
//! relationships:
//!     - used by: runtime.rs (subscribe), forwarder.rs (publish)
//!     - used by: main.rs (drives the mqtt event loop)
//!
//! ==============================================================================

use crate::config::MqttConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, pattern: &str) -> Result<()>;
    async fn unsubscribe(&self, pattern: &str) -> Result<()>;
}

// ==============================================================================
// MQTT IMPLEMENTATION
// ==============================================================================

/// shared set of patterns, replayed after every reconnect
type Subscriptions = Arc<Mutex<BTreeSet<String>>>;

pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

/// the receiving half; must be polled for anything to happen
pub struct MqttEvents {
    eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
}

impl MqttTransport {
    pub fn connect(config: &MqttConfig) -> (Self, MqttEvents) {
        let client_id = format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let subscriptions: Subscriptions = Arc::default();

        info!(host = %config.host, port = config.port, "MQTT client created");

        let events = MqttEvents {
            eventloop,
            client: client.clone(),
            subscriptions: subscriptions.clone(),
        };
        (Self { client, subscriptions }, events)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("Failed to subscribe to {}", pattern))?;
        lock(&self.subscriptions).insert(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        lock(&self.subscriptions).remove(pattern);
        self.client
            .unsubscribe(pattern)
            .await
            .with_context(|| format!("Failed to unsubscribe from {}", pattern))
    }
}

impl MqttEvents {
    /// polls the connection forever, handing every inbound publish to
    /// `on_publish`. rumqttc reconnects on the next poll after an error.
    pub async fn run<F, Fut>(mut self, mut on_publish: F)
    where
        F: FnMut(String, Vec<u8>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    on_publish(publish.topic, publish.payload.to_vec()).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    self.resubscribe().await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        let patterns: Vec<String> = lock(&self.subscriptions).iter().cloned().collect();
        for pattern in patterns {
            debug!(%pattern, "resubscribing");
            if let Err(e) = self.client.subscribe(pattern.as_str(), QoS::AtLeastOnce).await {
                warn!("Failed to resubscribe to {}: {}", pattern, e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ==============================================================================
// MEMORY IMPLEMENTATION (tests and replay)
// ==============================================================================

/// records everything instead of talking to a broker
#[derive(Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<(String, String)>>,
    subscriptions: Mutex<BTreeSet<String>>,
    fail_publish: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// make every following publish fail (or succeed again)
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// (topic, payload) in publish order
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            anyhow::bail!("publish to {} refused", topic);
        }
        debug!("[MEMORY] publish {} {}", topic, payload);
        lock(&self.published).push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        lock(&self.subscriptions).insert(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        lock(&self.subscriptions).remove(pattern);
        Ok(())
    }
}
