//! ==============================================================================
//! cache.rs - recent accepted readings per device
//! ==============================================================================
//!
//! purpose:
//!     keeps a short, time ordered history of accepted readings for every
//!     device identity so new readings can be judged against the last good
//!     one. entries older than the max age fall off the front.
//!
//! relationships:
//!     - owns: validation.rs (ValidationPipeline)
//!     - used by: runtime.rs (add on every known reading), api.rs (views)
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::device::DeviceReading;
use crate::validation::{ValidationError, ValidationPipeline};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// how long readings stay relevant for validation
pub const DEFAULT_MAX_AGE_SECS: i64 = 5 * 60;

/// one accepted reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataEntry {
    pub topic: String,
    pub reading: DeviceReading,
    /// payload as received
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl DataEntry {
    pub fn new(topic: impl Into<String>, reading: DeviceReading, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self { topic: topic.into(), reading, data, timestamp }
    }
}

/// per key summary for the inspection api
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub key: String,
    pub count: usize,
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

pub struct DataCache {
    entries: HashMap<String, VecDeque<DataEntry>>,
    pipeline: ValidationPipeline,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl DataCache {
    pub fn new(pipeline: ValidationPipeline, clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            pipeline,
            clock,
            max_age,
        }
    }

    /// validates `entry` against the fresh history for `key` and appends it
    /// when accepted
    pub fn add(&mut self, key: &str, mut entry: DataEntry) -> Result<(), ValidationError> {
        let cutoff = self.clock.now() - self.max_age;

        let Some(sequence) = self.entries.get_mut(key) else {
            self.pipeline.validate(&[], &entry)?;
            self.entries.insert(key.to_string(), VecDeque::from([entry]));
            return Ok(());
        };

        evict_stale(sequence, cutoff);
        if let Err(rejection) = self.pipeline.validate(sequence.make_contiguous(), &entry) {
            // a fully aged out history must not linger as an empty key
            if sequence.is_empty() {
                self.entries.remove(key);
            }
            return Err(rejection);
        }

        // keep the sequence non-decreasing in time
        if let Some(tail) = sequence.back() {
            if entry.timestamp < tail.timestamp {
                entry.timestamp = tail.timestamp;
            }
        }
        sequence.push_back(entry);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&VecDeque<DataEntry>> {
        self.entries.get(key)
    }

    pub fn latest(&self, key: &str) -> Option<&DataEntry> {
        self.entries.get(key)?.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &VecDeque<DataEntry>)> {
        self.entries.iter()
    }

    /// drops stale entries everywhere and removes keys left empty.
    /// returns the number of keys removed.
    pub fn cleanup(&mut self) -> usize {
        let cutoff = self.clock.now() - self.max_age;

        let mut removed = Vec::new();
        self.entries.retain(|key, sequence| {
            evict_stale(sequence, cutoff);
            if sequence.is_empty() {
                removed.push(key.clone());
                return false;
            }
            true
        });

        for key in &removed {
            self.pipeline.forget(key);
        }
        removed.len()
    }

    /// number of device keys
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// per key counts and time span, oldest first
    pub fn summary(&self) -> Vec<CacheSummary> {
        let mut summary: Vec<CacheSummary> = self
            .entries
            .iter()
            .filter_map(|(key, sequence)| {
                Some(CacheSummary {
                    key: key.clone(),
                    count: sequence.len(),
                    oldest: sequence.front()?.timestamp,
                    newest: sequence.back()?.timestamp,
                })
            })
            .collect();
        summary.sort_by(|a, b| a.oldest.cmp(&b.oldest).then_with(|| a.key.cmp(&b.key)));
        summary
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn pipeline_mut(&mut self) -> &mut ValidationPipeline {
        &mut self.pipeline
    }
}

/// entries are time ordered, so only the head can be stale
fn evict_stale(sequence: &mut VecDeque<DataEntry>, cutoff: DateTime<Utc>) {
    while sequence.front().is_some_and(|e| e.timestamp < cutoff) {
        sequence.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ValidationConfig;
    use crate::validation::{Severity, Validator};
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        cache: DataCache,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let cache = DataCache::new(
            ValidationPipeline::standard(&ValidationConfig::default()),
            clock.clone(),
            Duration::seconds(DEFAULT_MAX_AGE_SECS),
        );
        Fixture { clock, cache }
    }

    fn tower(clock: &ManualClock, id: &str, temperature: f64) -> DataEntry {
        let data = json!({
            "id": id, "model": "Tower", "channel": "A",
            "temperature_C": temperature, "humidity": 45
        });
        let reading = DeviceReading::from_value(&data).unwrap();
        DataEntry::new(format!("src/dev1/Tower/A/{}", id), reading, data, clock.now())
    }

    #[test]
    fn accepted_readings_are_appended() {
        let mut f = fixture();
        let first = tower(&f.clock, "1", 20.0);
        let key = first.reading.identity();

        f.cache.add(&key, first).unwrap();
        f.clock.advance(Duration::seconds(30));
        f.cache.add(&key, tower(&f.clock, "1", 21.0)).unwrap();

        assert_eq!(f.cache.get(&key).unwrap().len(), 2);
        assert_eq!(f.cache.latest(&key).unwrap().reading.temperature(), Some(21.0));
        assert_eq!(f.cache.count(), 1);
    }

    #[test]
    fn rejected_reading_is_not_cached() {
        let mut f = fixture();
        let key = "A:Tower:1";
        f.cache.add(key, tower(&f.clock, "1", 20.0)).unwrap();

        let err = f.cache.add(key, tower(&f.clock, "1", 40.0)).unwrap_err();
        assert_eq!(err.measurement, "temperature_C");
        assert_eq!(f.cache.get(key).unwrap().len(), 1);
    }

    #[test]
    fn stale_history_no_longer_constrains() {
        let mut f = fixture();
        let key = "A:Tower:1";
        f.cache.add(key, tower(&f.clock, "1", 20.0)).unwrap();

        f.clock.advance(Duration::minutes(6));
        f.cache.add(key, tower(&f.clock, "1", 40.0)).unwrap();

        let sequence = f.cache.get(key).unwrap();
        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence[0].reading.temperature(), Some(40.0));
    }

    #[test]
    fn eviction_only_removes_from_the_head() {
        let mut f = fixture();
        let key = "A:Tower:1";
        for (i, t) in [20.0, 20.5, 21.0, 21.5].iter().enumerate() {
            f.cache.add(key, tower(&f.clock, "1", *t)).unwrap();
            if i < 3 {
                f.clock.advance(Duration::minutes(2));
            }
        }
        // t=0, 2, 4, 6 minutes; now is 6, cutoff is 1
        assert_eq!(f.cache.cleanup(), 0);

        let temps: Vec<_> = f
            .cache
            .get(key)
            .unwrap()
            .iter()
            .map(|e| e.reading.temperature().unwrap())
            .collect();
        assert_eq!(temps, vec![20.5, 21.0, 21.5]);
    }

    /// rejects anything hotter than 50 C, history or not
    struct Ceiling;

    impl Validator for Ceiling {
        fn name(&self) -> &'static str {
            "ceiling"
        }

        fn can_validate(&self, reading: &DeviceReading) -> bool {
            reading.temperature().is_some()
        }

        fn validate(&mut self, _history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
            match candidate.reading.temperature() {
                Some(t) if t > 50.0 => Err(ValidationError {
                    measurement: "temperature_C".to_string(),
                    prior_value: None,
                    new_value: Some(t),
                    message: "too hot".to_string(),
                    severity: Severity::Warning,
                }),
                _ => Ok(()),
            }
        }
    }

    /// records which devices the cache asked it to forget
    struct Forgetful {
        forgotten: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Validator for Forgetful {
        fn name(&self) -> &'static str {
            "forgetful"
        }

        fn can_validate(&self, _reading: &DeviceReading) -> bool {
            false
        }

        fn validate(&mut self, _history: &[DataEntry], _candidate: &DataEntry) -> Result<(), ValidationError> {
            Ok(())
        }

        fn forget(&mut self, device: &str) {
            self.forgotten.lock().unwrap().push(device.to_string());
        }
    }

    #[test]
    fn rejection_after_full_eviction_leaves_no_key() {
        let clock = Arc::new(ManualClock::default());
        let mut cache = DataCache::new(
            ValidationPipeline::new().with(Ceiling),
            clock.clone(),
            Duration::seconds(DEFAULT_MAX_AGE_SECS),
        );
        let key = "A:Tower:1";
        cache.add(key, tower(&clock, "1", 20.0)).unwrap();

        clock.advance(Duration::minutes(6));
        assert!(cache.add(key, tower(&clock, "1", 60.0)).is_err());
        assert!(cache.get(key).is_none());
        assert_eq!(cache.count(), 0);
        assert!(cache.summary().is_empty());
    }

    #[test]
    fn cleanup_forgets_removed_devices() {
        let clock = Arc::new(ManualClock::default());
        let forgotten = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut cache = DataCache::new(
            ValidationPipeline::new().with(Forgetful { forgotten: forgotten.clone() }),
            clock.clone(),
            Duration::seconds(DEFAULT_MAX_AGE_SECS),
        );
        cache.add("A:Tower:1", tower(&clock, "1", 20.0)).unwrap();
        cache.add("A:Tower:2", tower(&clock, "2", 20.0)).unwrap();
        clock.advance(Duration::minutes(4));
        cache.add("A:Tower:3", tower(&clock, "3", 20.0)).unwrap();

        clock.advance(Duration::minutes(2));
        assert_eq!(cache.cleanup(), 2);

        let mut forgotten = forgotten.lock().unwrap().clone();
        forgotten.sort();
        assert_eq!(forgotten, vec!["A:Tower:1".to_string(), "A:Tower:2".to_string()]);
    }

    #[test]
    fn cleanup_removes_empty_keys() {
        let mut f = fixture();
        f.cache.add("A:Tower:1", tower(&f.clock, "1", 20.0)).unwrap();
        f.cache.add("A:Tower:2", tower(&f.clock, "2", 20.0)).unwrap();
        f.clock.advance(Duration::minutes(4));
        f.cache.add("A:Tower:3", tower(&f.clock, "3", 20.0)).unwrap();

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.cache.cleanup(), 2);
        assert_eq!(f.cache.count(), 1);
        assert!(f.cache.get("A:Tower:1").is_none());
        assert!(f.cache.get("A:Tower:3").is_some());
    }

    #[test]
    fn unknown_keys_are_never_fabricated() {
        let mut f = fixture();
        assert!(f.cache.get("nope").is_none());
        assert!(f.cache.latest("nope").is_none());
        assert_eq!(f.cache.count(), 0);

        // a validator that rejects everything
        struct Never;
        impl crate::validation::Validator for Never {
            fn name(&self) -> &'static str {
                "never"
            }
            fn can_validate(&self, _: &DeviceReading) -> bool {
                true
            }
            fn validate(&mut self, _: &[DataEntry], _: &DataEntry) -> Result<(), ValidationError> {
                Err(ValidationError {
                    measurement: "any".into(),
                    prior_value: None,
                    new_value: None,
                    message: "no".into(),
                    severity: crate::validation::Severity::Error,
                })
            }
        }
        let mut cache = DataCache::new(
            ValidationPipeline::new().with(Never),
            f.clock.clone(),
            Duration::minutes(5),
        );
        assert!(cache.add("A:Tower:1", tower(&f.clock, "1", 20.0)).is_err());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut f = fixture();
        let key = "A:Tower:1";
        f.cache.add(key, tower(&f.clock, "1", 20.0)).unwrap();

        let mut late = tower(&f.clock, "1", 20.0);
        late.timestamp = f.clock.now() - Duration::seconds(10);
        f.cache.add(key, late).unwrap();

        let sequence = f.cache.get(key).unwrap();
        assert_eq!(sequence[1].timestamp, sequence[0].timestamp);
    }

    #[test]
    fn summary_is_sorted_by_oldest() {
        let mut f = fixture();
        f.cache.add("A:Tower:2", tower(&f.clock, "2", 20.0)).unwrap();
        f.clock.advance(Duration::seconds(10));
        f.cache.add("A:Tower:1", tower(&f.clock, "1", 20.0)).unwrap();
        f.cache.add("A:Tower:2", tower(&f.clock, "2", 20.0)).unwrap();

        let summary = f.cache.summary();
        assert_eq!(summary[0].key, "A:Tower:2");
        assert_eq!(summary[0].count, 2);
        assert!(summary[0].newest > summary[0].oldest);
        assert_eq!(summary[1].key, "A:Tower:1");
    }
}
