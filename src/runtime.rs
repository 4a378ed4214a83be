//! ==============================================================================
//! runtime.rs - the filter service
//! ==============================================================================
//!
//! purpose:
//!     wires the subscription registry, the cache, the forwarder and the store
//!     together and implements what happens to every inbound message.
//!
//! message flow:
//!
//! ```text
//!     broker ──> dispatch(topic) ──> registry ──> handler
//!                                                   │
//!                         store every message <─────┤
//!                                                   ▼
//!                              not json ─────────> forward (keyed by topic)
//!                              unknown device ───> forward (keyed by topic)
//!                              known device ─────> cache.add (validation)
//!                                                   │
//!                                        rejected <─┴─> accepted
//!                                      (count, log)     forward (keyed by identity)
//! ```
//!
//! relationships:
//!     - used by: main.rs (creates runtime, feeds the mqtt event loop)
//!     - used by: api.rs (read only views)
//!     - owns: topic.rs registry, cache.rs, forwarder.rs, stats.rs
//!
//! ==============================================================================

use crate::cache::{DataCache, DataEntry};
use crate::clock::Clock;
use crate::config::FilterConfig;
use crate::device::{DeviceReading, MqttMessage};
use crate::error::{FilterError, Result};
use crate::forwarder::{Forwarder, ProbeThrottle};
use crate::stats::{Inbound, StatsSnapshot, Statistics};
use crate::store::{MessageStore, StoredMessage};
use crate::topic::{TopicRegistry, TopicRewriter};
use crate::transport::Transport;
use crate::validation::ValidationPipeline;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// a subscription callback: (topic, raw payload)
pub type Handler =
    Arc<dyn Fn(String, Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// result of a manual cache cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub initial_count: usize,
    pub deleted: usize,
    pub final_count: usize,
}

// ==============================================================================
// ingest - per message processing
// ==============================================================================
// kept apart from the registry so handlers can hold it without the registry
// holding itself.

#[derive(Clone)]
struct Ingest {
    cache: Arc<Mutex<DataCache>>,
    forwarder: Forwarder,
    store: Option<Arc<dyn MessageStore>>,
    stats: Arc<Statistics>,
    clock: Arc<dyn Clock>,
}

impl Ingest {
    async fn process(&self, topic: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        let message = MqttMessage::new(topic, text);

        let reading = message.data.as_ref().and_then(DeviceReading::from_value);
        let key = reading.as_ref().map(DeviceReading::identity);

        self.persist(&message, key.clone()).await;

        match (reading, key) {
            (Some(reading), Some(key)) => {
                self.stats.record_received(Inbound::Device);
                self.accept_reading(key, reading, message).await;
            }
            _ => {
                let kind = if message.data.is_some() {
                    Inbound::Unknown
                } else {
                    Inbound::Unparseable
                };
                self.stats.record_received(kind);
                debug!(%topic, ?kind, "forwarding opaque message");
                self.forwarder.throttle_message(topic, message).await;
            }
        }
    }

    async fn accept_reading(&self, key: String, reading: DeviceReading, message: MqttMessage) {
        let data = message.data.clone().unwrap_or_default();
        let entry = DataEntry::new(message.topic.clone(), reading, data, self.clock.now());

        let verdict = self.cache.lock().await.add(&key, entry);
        match verdict {
            Ok(()) => self.forwarder.throttle_message(&key, message).await,
            Err(rejection) => {
                debug!(%key, %rejection, "reading rejected");
                self.stats.record_rejected(&key, &rejection.to_string());
            }
        }
    }

    async fn persist(&self, message: &MqttMessage, device_id: Option<String>) {
        let Some(store) = &self.store else {
            return;
        };
        let stored = StoredMessage {
            timestamp: self.clock.now(),
            device_id,
            topic: message.topic.clone(),
            message: message.message.clone(),
        };
        if let Err(e) = store.store(stored).await {
            warn!("Failed to store message from {}: {:#}", message.topic, e);
        }
    }
}

// ==============================================================================
// filter runtime - main public interface
// ==============================================================================

/// clone-able handle to the shared filter state
#[derive(Clone)]
pub struct FilterRuntime {
    registry: Arc<RwLock<TopicRegistry<Handler>>>,
    transport: Arc<dyn Transport>,
    ingest: Ingest,
    source_topic: String,
}

impl FilterRuntime {
    pub fn new(
        config: &FilterConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn MessageStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let stats = Arc::new(Statistics::new(clock.clone()));

        let rewriter = TopicRewriter::new(&config.topics.src, &config.topics.dst)?;
        let forwarder = Forwarder::builder(transport.clone(), rewriter, stats.clone())
            .default_interval(Duration::from_secs(config.throttle.default_interval_secs))
            .policy(ProbeThrottle::new(
                config.throttle.probe_threshold_c,
                Duration::from_secs(config.throttle.probe_interval_secs),
            ))
            .build();

        let cache = DataCache::new(
            ValidationPipeline::standard(&config.validation),
            clock.clone(),
            chrono::Duration::seconds(config.cache.max_age_secs as i64),
        );

        Ok(Self {
            registry: Arc::new(RwLock::new(TopicRegistry::new())),
            transport,
            ingest: Ingest {
                cache: Arc::new(Mutex::new(cache)),
                forwarder,
                store,
                stats,
                clock,
            },
            source_topic: config.topics.src.clone(),
        })
    }

    /// subscribes the filter itself to the configured source pattern
    pub async fn start(&self) -> Result<()> {
        let ingest = self.ingest.clone();
        let handler: Handler = Arc::new(move |topic, payload| {
            let ingest = ingest.clone();
            Box::pin(async move { ingest.process(&topic, &payload).await })
        });

        self.subscribe(&self.source_topic, handler).await?;
        info!("Filtering {}", self.source_topic);
        Ok(())
    }

    /// registers `handler` and subscribes on the broker
    pub async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<()> {
        self.registry_write().register(pattern, handler)?;
        self.transport
            .subscribe(pattern)
            .await
            .map_err(|e| FilterError::Transport(format!("{:#}", e)))
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<bool> {
        let removed = self.registry_write().unregister(pattern);
        if removed {
            self.transport
                .unsubscribe(pattern)
                .await
                .map_err(|e| FilterError::Transport(format!("{:#}", e)))?;
        }
        Ok(removed)
    }

    /// runs every handler whose pattern matches `topic`
    pub async fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        // clone handlers out so no lock is held while they run
        let handlers = match self.registry_read().dispatch(topic) {
            Ok(handlers) => handlers,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return;
            }
        };

        if handlers.is_empty() {
            debug!(%topic, "no subscription matches");
        }
        for handler in handlers {
            handler(topic.to_string(), payload.clone()).await;
        }
    }

    /// the default handler, without going through the registry
    pub async fn process_message(&self, topic: &str, payload: &[u8]) {
        self.ingest.process(topic, payload).await;
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let active = self.ingest.forwarder.job_count().await;
        let devices = self.ingest.cache.lock().await.count();
        self.ingest.stats.snapshot(active, devices)
    }

    pub async fn cleanup_cache(&self) -> CleanupReport {
        let mut cache = self.ingest.cache.lock().await;
        let initial_count = cache.count();
        let deleted = cache.cleanup();
        CleanupReport { initial_count, deleted, final_count: cache.count() }
    }

    /// stops every flush job
    pub async fn shutdown(&self) {
        self.ingest.forwarder.shutdown().await;
    }

    pub fn cache(&self) -> &Arc<Mutex<DataCache>> {
        &self.ingest.cache
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.ingest.forwarder
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.ingest.stats
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.ingest.store.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.ingest.clock
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, TopicRegistry<Handler>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, TopicRegistry<Handler>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}
