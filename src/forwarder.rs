//! ==============================================================================
//! forwarder.rs - throttled republishing
//! ==============================================================================
//!
//! purpose:
//!     gateways repeat every radio packet several times and several gateways
//!     hear the same sensor. the forwarder keeps only the latest message per
//!     device and publishes it at most once per interval.
//!
//! how it works:
//!     - one pending slot and one flush task per key (device identity, or the
//!       topic for messages that are not device readings)
//!     - a new message is merged into the pending one (best rssi wins)
//!     - the flush task ticks immediately, then every interval; a tick with
//!       nothing pending ends the task
//!
//! relationships:
//!     - used by: runtime.rs (throttle_message), api.rs (jobs)
//!     - uses: transport.rs (publish), topic.rs (TopicRewriter)
//!
//! ==============================================================================

use crate::device::{DeviceReading, MqttMessage};
use crate::stats::Statistics;
use crate::topic::TopicRewriter;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

// ==============================================================================
// policies
// ==============================================================================

/// combines a newly arrived message with the one still waiting
pub trait MessageMerger: Send + Sync {
    fn merge(&self, pending: Option<MqttMessage>, incoming: MqttMessage) -> MqttMessage;
}

/// keeps the newest payload but reports the strongest signal any gateway saw
#[derive(Debug, Default, Clone, Copy)]
pub struct RssiMerger;

impl MessageMerger for RssiMerger {
    fn merge(&self, pending: Option<MqttMessage>, mut incoming: MqttMessage) -> MqttMessage {
        let Some(pending) = pending else {
            return incoming;
        };
        if let (Some(old), Some(new)) = (pending.rssi(), incoming.rssi()) {
            incoming.set_rssi(old.max(new));
        }
        incoming
    }
}

/// per message override of the publish interval
pub trait ThrottlePolicy: Send + Sync {
    fn interval_for(&self, message: &MqttMessage) -> Option<Duration>;
}

/// a bbq probe above the threshold is cooking; publish it more often
#[derive(Debug, Clone)]
pub struct ProbeThrottle {
    pub threshold_c: f64,
    pub interval: Duration,
}

impl ProbeThrottle {
    pub fn new(threshold_c: f64, interval: Duration) -> Self {
        Self { threshold_c, interval }
    }
}

impl ThrottlePolicy for ProbeThrottle {
    fn interval_for(&self, message: &MqttMessage) -> Option<Duration> {
        let reading = DeviceReading::from_value(message.data.as_ref()?)?;
        let (food, oven) = reading.probe_temperatures()?;
        let hot = [food, oven]
            .into_iter()
            .flatten()
            .any(|t| t >= self.threshold_c);
        hot.then_some(self.interval)
    }
}

// ==============================================================================
// forwarder
// ==============================================================================

struct Job {
    handle: JoinHandle<()>,
    interval: Duration,
}

/// pending messages and their flush tasks, always changed together
#[derive(Default)]
struct Slots {
    pending: HashMap<String, MqttMessage>,
    jobs: HashMap<String, Job>,
}

struct Inner {
    slots: Mutex<Slots>,
    transport: Arc<dyn Transport>,
    rewriter: TopicRewriter,
    merger: Box<dyn MessageMerger>,
    policies: Vec<Box<dyn ThrottlePolicy>>,
    default_interval: Duration,
    stats: Arc<Statistics>,
}

/// one row of `/api/v1/forwarders`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub key: String,
    pub interval_secs: u64,
    pub queued: Option<MqttMessage>,
}

pub struct ForwarderBuilder {
    transport: Arc<dyn Transport>,
    rewriter: TopicRewriter,
    stats: Arc<Statistics>,
    merger: Box<dyn MessageMerger>,
    policies: Vec<Box<dyn ThrottlePolicy>>,
    default_interval: Duration,
}

impl ForwarderBuilder {
    pub fn default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    pub fn merger<M: MessageMerger + 'static>(mut self, merger: M) -> Self {
        self.merger = Box::new(merger);
        self
    }

    /// policies are consulted in order, first override wins
    pub fn policy<P: ThrottlePolicy + 'static>(mut self, policy: P) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn build(self) -> Forwarder {
        Forwarder {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots::default()),
                transport: self.transport,
                rewriter: self.rewriter,
                merger: self.merger,
                policies: self.policies,
                default_interval: self.default_interval,
                stats: self.stats,
            }),
        }
    }
}

/// cheap to clone; clones share the same slots
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<Inner>,
}

impl Forwarder {
    pub fn builder(
        transport: Arc<dyn Transport>,
        rewriter: TopicRewriter,
        stats: Arc<Statistics>,
    ) -> ForwarderBuilder {
        ForwarderBuilder {
            transport,
            rewriter,
            stats,
            merger: Box::new(RssiMerger),
            policies: Vec::new(),
            default_interval: DEFAULT_INTERVAL,
        }
    }

    /// queues `message` under `key` and makes sure a flush task is running
    pub async fn throttle_message(&self, key: &str, message: MqttMessage) {
        let mut slots = self.inner.slots.lock().await;

        let pending = slots.pending.remove(key);
        let merged = self.inner.merger.merge(pending, message);

        let running = slots
            .jobs
            .get(key)
            .is_some_and(|job| !job.handle.is_finished());

        if !running {
            // the interval is fixed for the lifetime of the task
            let interval = self.inner.interval_for(&merged);
            let handle = tokio::spawn(flush_loop(self.inner.clone(), key.to_string(), interval));
            slots.jobs.insert(key.to_string(), Job { handle, interval });
            self.inner.stats.job_started();
            debug!(key, interval_secs = interval.as_secs(), "flush job started");
        }

        slots.pending.insert(key.to_string(), merged);
    }

    /// (key, interval, queued message) for every live job, sorted by key
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let slots = self.inner.slots.lock().await;
        let mut jobs: Vec<JobInfo> = slots
            .jobs
            .iter()
            .filter(|(_, job)| !job.handle.is_finished())
            .map(|(key, job)| JobInfo {
                key: key.clone(),
                interval_secs: job.interval.as_secs(),
                queued: slots.pending.get(key).cloned(),
            })
            .collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    pub async fn job_count(&self) -> usize {
        let slots = self.inner.slots.lock().await;
        slots.jobs.values().filter(|job| !job.handle.is_finished()).count()
    }

    /// stops every flush task; pending messages are not published
    pub async fn shutdown(&self) {
        let mut slots = self.inner.slots.lock().await;
        let mut count = 0;
        for (_, job) in slots.jobs.drain() {
            // a finished task already counted itself as ended
            if !job.handle.is_finished() {
                count += 1;
                self.inner.stats.job_ended();
            }
            job.handle.abort();
        }
        slots.pending.clear();
        info!("Forwarder stopped {} flush jobs", count);
    }
}

impl Inner {
    fn interval_for(&self, message: &MqttMessage) -> Duration {
        self.policies
            .iter()
            .find_map(|policy| policy.interval_for(message))
            .unwrap_or(self.default_interval)
            .max(MIN_INTERVAL)
    }

    async fn flush(&self, key: &str, message: MqttMessage) {
        let topic = self.rewriter.rewrite(&message.topic);
        if topic.is_empty() {
            warn!(
                key,
                topic = %message.topic,
                source = self.rewriter.source(),
                "topic does not match the source pattern, dropping message"
            );
            self.stats.log_event(key, &format!("Unroutable topic {}", message.topic));
            return;
        }

        match self.transport.publish(&topic, &message.message).await {
            Ok(()) => {
                self.stats.record_sent();
                debug!(key, %topic, "published");
            }
            Err(e) => {
                warn!("Failed to publish {} for {}: {:#}", topic, key, e);
                self.stats
                    .record_publish_failure(key, &format!("Publish to {} failed: {}", topic, e));

                // retry on the next tick; anything that arrived meanwhile is
                // merged on top so its payload wins but the best rssi survives
                let mut slots = self.slots.lock().await;
                let newer = slots.pending.remove(key);
                let retry = match newer {
                    Some(newer) => self.merger.merge(Some(message), newer),
                    None => message,
                };
                slots.pending.insert(key.to_string(), retry);
            }
        }
    }
}

async fn flush_loop(inner: Arc<Inner>, key: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let message = {
            let mut slots = inner.slots.lock().await;
            match slots.pending.remove(&key) {
                Some(message) => message,
                None => {
                    slots.jobs.remove(&key);
                    break;
                }
            }
        };

        inner.flush(&key, message).await;
    }

    inner.stats.job_ended();
    debug!(key = %key, "flush job ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        transport: Arc<MemoryTransport>,
        stats: Arc<Statistics>,
        forwarder: Forwarder,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let stats = Arc::new(Statistics::new(Arc::new(SystemClock)));
        let forwarder = Forwarder::builder(
            transport.clone(),
            TopicRewriter::new("src/+/#", "dst/+/#").unwrap(),
            stats.clone(),
        )
        .policy(ProbeThrottle::new(150.0, Duration::from_secs(30)))
        .build();
        Fixture { transport, stats, forwarder }
    }

    fn tower(rssi: i64, temperature: f64) -> MqttMessage {
        MqttMessage::from_data(
            "src/dev1/Tower/A/5476",
            json!({ "id": "5476", "model": "Tower", "channel": "A", "rssi": rssi, "temperature_C": temperature }),
        )
    }

    /// lets the paused clock run the spawned flush tasks
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn rssi_merger_keeps_newest_payload_with_best_signal() {
        let merged = RssiMerger.merge(Some(tower(-40, 20.0)), tower(-80, 21.0));
        assert_eq!(merged.rssi(), Some(-40.0));
        assert!(merged.message.contains("\"temperature_C\":21.0"));

        let plain = MqttMessage::new("src/x", "online");
        let merged = RssiMerger.merge(Some(tower(-40, 20.0)), plain.clone());
        assert_eq!(merged, plain);

        assert_eq!(RssiMerger.merge(None, tower(-90, 1.0)).rssi(), Some(-90.0));
    }

    #[test]
    fn probe_throttle_applies_to_hot_probes_only() {
        let policy = ProbeThrottle::new(150.0, Duration::from_secs(30));
        let probe = |oven: f64| {
            MqttMessage::from_data(
                "src/x",
                json!({ "id": "31", "model": "Maverick-ET73", "temperature_1_C": 20.0, "temperature_2_C": oven }),
            )
        };
        assert_eq!(policy.interval_for(&probe(150.0)), Some(Duration::from_secs(30)));
        assert_eq!(policy.interval_for(&probe(149.9)), None);
        assert_eq!(policy.interval_for(&tower(-50, 200.0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn two_messages_before_first_tick_publish_once() {
        let f = fixture();
        f.forwarder.throttle_message("A:Tower:5476", tower(-50, 20.0)).await;
        f.forwarder.throttle_message("A:Tower:5476", tower(-70, 20.5)).await;
        assert_eq!(f.forwarder.job_count().await, 1);

        settle().await;

        let published = f.transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "dst/dev1/Tower/A/5476");
        let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(payload["rssi"], -50);
        assert_eq!(payload["temperature_C"], 20.5);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_job_is_removed_after_one_empty_tick() {
        let f = fixture();
        f.forwarder.throttle_message("A:Tower:5476", tower(-50, 20.0)).await;
        settle().await;
        assert_eq!(f.forwarder.job_count().await, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.forwarder.job_count().await, 0);
        assert_eq!(f.transport.published().len(), 1);

        let stats = f.stats.forwarders(0);
        assert_eq!(stats.lifetime, 1);
        assert_eq!(stats.ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_message_waits_for_next_tick() {
        let f = fixture();
        f.forwarder.throttle_message("A:Tower:5476", tower(-50, 20.0)).await;
        settle().await;
        f.forwarder.throttle_message("A:Tower:5476", tower(-60, 20.5)).await;

        let jobs = f.forwarder.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_secs, 60);
        assert!(jobs[0].queued.is_some());
        assert_eq!(f.transport.published().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let published = f.transport.published();
        assert_eq!(published.len(), 2);
        assert!(published[1].1.contains("20.5"));
        assert_eq!(f.stats.forwarders(0).lifetime, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_is_retried() {
        let f = fixture();
        f.transport.set_fail_publish(true);
        f.forwarder.throttle_message("A:Tower:5476", tower(-50, 20.0)).await;
        settle().await;

        assert!(f.transport.published().is_empty());
        let jobs = f.forwarder.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].queued.is_some());
        assert_eq!(f.stats.mqtt().sent.failed, 1);

        f.transport.set_fail_publish(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.transport.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hot_probe_gets_short_interval() {
        let f = fixture();
        let probe = MqttMessage::from_data(
            "src/dev1/Maverick-ET73/31",
            json!({ "id": "31", "model": "Maverick-ET73", "temperature_1_C": 60.0, "temperature_2_C": 180.0 }),
        );
        f.forwarder.throttle_message("Maverick-ET73:31", probe).await;

        let jobs = f.forwarder.jobs().await;
        assert_eq!(jobs[0].interval_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn unroutable_topic_is_dropped() {
        let f = fixture();
        f.forwarder
            .throttle_message("elsewhere/status", MqttMessage::new("elsewhere/status", "online"))
            .await;
        settle().await;

        assert!(f.transport.published().is_empty());
        assert_eq!(f.stats.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_jobs() {
        let f = fixture();
        f.forwarder.throttle_message("a", tower(-50, 20.0)).await;
        f.forwarder.throttle_message("b", tower(-50, 20.0)).await;
        assert_eq!(f.forwarder.job_count().await, 2);

        f.forwarder.shutdown().await;
        assert_eq!(f.forwarder.job_count().await, 0);
        settle().await;
        assert!(f.transport.published().is_empty());

        let stats = f.stats.forwarders(0);
        assert_eq!(stats.lifetime, 2);
        assert_eq!(stats.ended, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_count_finished_jobs_twice() {
        let f = fixture();
        f.forwarder.throttle_message("a", tower(-50, 20.0)).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.stats.forwarders(0).ended, 1);

        f.forwarder.throttle_message("b", tower(-50, 20.0)).await;
        f.forwarder.shutdown().await;

        let stats = f.stats.forwarders(0);
        assert_eq!(stats.lifetime, 2);
        assert_eq!(stats.ended, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_fixed_when_the_job_starts() {
        let f = fixture();
        let probe = |oven: f64| {
            MqttMessage::from_data(
                "src/dev1/Maverick-ET73/31",
                json!({ "id": "31", "model": "Maverick-ET73", "temperature_1_C": 60.0, "temperature_2_C": oven }),
            )
        };

        f.forwarder.throttle_message("Maverick-ET73:31", probe(100.0)).await;
        settle().await;
        assert_eq!(f.transport.published().len(), 1);

        // the probe heats up while the cool job is still running
        f.forwarder.throttle_message("Maverick-ET73:31", probe(180.0)).await;
        let jobs = f.forwarder.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_secs, 60);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.transport.published().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let published = f.transport.published();
        assert_eq!(published.len(), 2);
        assert!(published[1].1.contains("180"));
    }

    /// first publish hangs for a while and then fails, later ones succeed
    #[derive(Default)]
    struct FlakyTransport {
        attempts: AtomicUsize,
        published: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn publish(&self, topic: &str, payload: &str) -> anyhow::Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::bail!("broker went away");
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        async fn subscribe(&self, _pattern: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _pattern: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_keeps_best_rssi_of_later_arrivals() {
        let transport = Arc::new(FlakyTransport::default());
        let stats = Arc::new(Statistics::new(Arc::new(SystemClock)));
        let forwarder = Forwarder::builder(
            transport.clone(),
            TopicRewriter::new("src/+/#", "dst/+/#").unwrap(),
            stats.clone(),
        )
        .build();

        forwarder.throttle_message("A:Tower:5476", tower(-40, 20.0)).await;
        settle().await;

        // a weaker retransmit lands while the publish is still in flight
        forwarder.throttle_message("A:Tower:5476", tower(-80, 20.5)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(stats.mqtt().sent.failed, 1);

        let jobs = forwarder.jobs().await;
        let queued = jobs[0].queued.as_ref().unwrap();
        assert_eq!(queued.rssi(), Some(-40.0));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let published = transport.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(payload["rssi"], -40);
        assert_eq!(payload["temperature_C"], 20.5);
    }
}
