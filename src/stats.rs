//! ==============================================================================
//! stats.rs - counters, message rates and the recent event log
//! ==============================================================================
//!
//! purpose:
//!     everything the inspection api reports that is not the cache or the
//!     forwarder itself. counters are only ever incremented; rates are
//!     averaged over a sliding five minute window.
//!
//! relationships:
//!     - written by: runtime.rs (inbound), forwarder.rs (sent, jobs)
//!     - read by: api.rs
//!
//! ==============================================================================

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

const RATE_WINDOW_MINUTES: i64 = 5;
const RATE_PURGE_EVERY_SECS: i64 = 60;

const LOG_RETENTION_DAYS: i64 = 2;
const LOG_PURGE_EVERY_HOURS: i64 = 2;
pub const LOG_CAPACITY: usize = 1000;

// ==============================================================================
// rate meter
// ==============================================================================

/// events per second / minute over a sliding window
#[derive(Debug)]
pub struct RateMeter {
    marks: VecDeque<DateTime<Utc>>,
    window: Duration,
    last_purged: DateTime<Utc>,
}

impl RateMeter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            marks: VecDeque::new(),
            window: Duration::minutes(RATE_WINDOW_MINUTES),
            last_purged: now,
        }
    }

    pub fn mark(&mut self, now: DateTime<Utc>) {
        self.age_out(now, false);
        self.marks.push_back(now);
    }

    pub fn per_minute(&mut self, now: DateTime<Utc>) -> f64 {
        self.age_out(now, true);
        round2(self.marks.len() as f64 / RATE_WINDOW_MINUTES as f64)
    }

    pub fn per_second(&mut self, now: DateTime<Utc>) -> f64 {
        self.age_out(now, true);
        round2(self.marks.len() as f64 / self.window.num_seconds() as f64)
    }

    /// purging is throttled to once a minute unless forced
    fn age_out(&mut self, now: DateTime<Utc>, force: bool) {
        if self.marks.is_empty() {
            return;
        }
        if !force && now - self.last_purged < Duration::seconds(RATE_PURGE_EVERY_SECS) {
            return;
        }

        let cutoff = now - self.window;
        while self.marks.front().is_some_and(|m| *m < cutoff) {
            self.marks.pop_front();
        }
        self.last_purged = now;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.marks.len()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ==============================================================================
// event log
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub message: String,
}

/// recent noteworthy events (rejections, publish failures)
#[derive(Debug)]
pub struct MsgLog {
    entries: VecDeque<LogEntry>,
    retention: Duration,
    last_purged: DateTime<Utc>,
}

impl MsgLog {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            entries: VecDeque::new(),
            retention: Duration::days(LOG_RETENTION_DAYS),
            last_purged: now,
        }
    }

    pub fn add(&mut self, now: DateTime<Utc>, device_id: &str, message: &str) {
        self.remove_stale(now, false);
        if self.entries.len() >= LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: now,
            device_id: device_id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn entries(&mut self, now: DateTime<Utc>) -> Vec<LogEntry> {
        self.remove_stale(now, true);
        self.entries.iter().cloned().collect()
    }

    fn remove_stale(&mut self, now: DateTime<Utc>, force: bool) {
        if self.entries.is_empty() {
            return;
        }
        if !force && now - self.last_purged < Duration::hours(LOG_PURGE_EVERY_HOURS) {
            return;
        }

        let cutoff = now - self.retention;
        while self.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            self.entries.pop_front();
        }
        self.last_purged = now;
    }
}

// ==============================================================================
// snapshot types (api json)
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rates {
    pub per_sec: f64,
    pub per_min: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceivedStats {
    pub total: u64,
    /// known devices
    pub omg: u64,
    /// known devices whose reading failed validation
    pub omg_invalid: u64,
    pub unknown: u64,
    pub unparseable: u64,
    pub rates: Rates,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SentStats {
    pub total: u64,
    pub failed: u64,
    pub pct_fwded: f64,
    pub rates: Rates,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MqttStats {
    pub received: ReceivedStats,
    pub sent: SentStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwarderStats {
    pub active: usize,
    pub ended: u64,
    pub lifetime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub devices: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStats {
    pub start_time: DateTime<Utc>,
    pub uptime: String,
    pub uptime_secs: i64,
    pub memory: MemoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub forwarders: ForwarderStats,
    pub mqtt: MqttStats,
    pub cache: CacheStats,
    pub app: AppStats,
}

/// how an inbound message was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Device,
    Unknown,
    Unparseable,
}

// ==============================================================================
// statistics
// ==============================================================================

struct Counters {
    received: ReceivedStats,
    sent: SentStats,
    jobs_ended: u64,
    jobs_lifetime: u64,
    received_rate: RateMeter,
    sent_rate: RateMeter,
    log: MsgLog,
}

/// process wide statistics, shared behind an `Arc`
pub struct Statistics {
    clock: Arc<dyn Clock>,
    started: DateTime<Utc>,
    counters: Mutex<Counters>,
}

impl Statistics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            started: now,
            counters: Mutex::new(Counters {
                received: ReceivedStats::default(),
                sent: SentStats::default(),
                jobs_ended: 0,
                jobs_lifetime: 0,
                received_rate: RateMeter::new(now),
                sent_rate: RateMeter::new(now),
                log: MsgLog::new(now),
            }),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_received(&self, kind: Inbound) {
        let now = self.clock.now();
        let mut c = self.counters();
        c.received.total += 1;
        match kind {
            Inbound::Device => c.received.omg += 1,
            Inbound::Unknown => c.received.unknown += 1,
            Inbound::Unparseable => c.received.unparseable += 1,
        }
        c.received_rate.mark(now);
    }

    /// a known device reading failed validation
    pub fn record_rejected(&self, device_id: &str, reason: &str) {
        let now = self.clock.now();
        let mut c = self.counters();
        c.received.omg_invalid += 1;
        c.log.add(now, device_id, reason);
    }

    pub fn record_sent(&self) {
        let now = self.clock.now();
        let mut c = self.counters();
        c.sent.total += 1;
        c.sent_rate.mark(now);
    }

    pub fn record_publish_failure(&self, device_id: &str, reason: &str) {
        let now = self.clock.now();
        let mut c = self.counters();
        c.sent.failed += 1;
        c.log.add(now, device_id, reason);
    }

    pub fn job_started(&self) {
        self.counters().jobs_lifetime += 1;
    }

    pub fn job_ended(&self) {
        self.counters().jobs_ended += 1;
    }

    pub fn log_event(&self, device_id: &str, message: &str) {
        let now = self.clock.now();
        self.counters().log.add(now, device_id, message);
    }

    pub fn events(&self) -> Vec<LogEntry> {
        let now = self.clock.now();
        self.counters().log.entries(now)
    }

    pub fn mqtt(&self) -> MqttStats {
        let now = self.clock.now();
        let mut c = self.counters();

        let received_rates = Rates {
            per_sec: c.received_rate.per_second(now),
            per_min: c.received_rate.per_minute(now),
        };
        let sent_rates = Rates {
            per_sec: c.sent_rate.per_second(now),
            per_min: c.sent_rate.per_minute(now),
        };

        let pct_fwded = if c.received.total == 0 {
            0.0
        } else {
            round2(c.sent.total as f64 / c.received.total as f64 * 100.0)
        };

        MqttStats {
            received: ReceivedStats { rates: received_rates, ..c.received.clone() },
            sent: SentStats { pct_fwded, rates: sent_rates, ..c.sent.clone() },
        }
    }

    /// `active` is the live job count, which only the forwarder knows
    pub fn forwarders(&self, active: usize) -> ForwarderStats {
        let c = self.counters();
        ForwarderStats { active, ended: c.jobs_ended, lifetime: c.jobs_lifetime }
    }

    pub fn app(&self) -> AppStats {
        let uptime = self.clock.now() - self.started;
        AppStats {
            start_time: self.started,
            uptime: format_uptime(uptime),
            uptime_secs: uptime.num_seconds(),
            memory: process_memory(),
        }
    }

    pub fn snapshot(&self, active_jobs: usize, cached_devices: usize) -> StatsSnapshot {
        StatsSnapshot {
            forwarders: self.forwarders(active_jobs),
            mqtt: self.mqtt(),
            cache: CacheStats { devices: cached_devices },
            app: self.app(),
        }
    }
}

/// "1d 2:03:04" style
fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.num_seconds().max(0);
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (h, m, s) = (rest / 3600, (rest % 3600) / 60, rest % 60);
    if days > 0 {
        format!("{}d {}:{:02}:{:02}", days, h, m, s)
    } else {
        format!("{}:{:02}:{:02}", h, m, s)
    }
}

fn process_memory() -> MemoryStats {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return MemoryStats::default();
    };
    let mut sys = sysinfo::System::new();
    sys.refresh_process(pid);
    sys.process(pid)
        .map(|p| MemoryStats { rss_bytes: p.memory(), virtual_bytes: p.virtual_memory() })
        .unwrap_or_default()
}
