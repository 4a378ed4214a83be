//! ==============================================================================
//! validation.rs - anomaly filtering for incoming readings
//! ==============================================================================
//!
//! purpose:
//!     cheap radio sensors produce occasional garbage (a 40 degree jump, a rain
//!     total that resets). each validator compares a new reading with the last
//!     accepted reading of the same device and vetoes implausible values.
//!
//! rules:
//!     bounded delta    - temperature, humidity, probe temperature
//!                        candidate must stay within +/- range of the prior
//!     confirm twice    - rain total, lightning strike count
//!                        cumulative counters only grow, and a grown value
//!                        must be seen twice in a row before it is accepted
//!
//! relationships:
//!     - owned by: cache.rs (DataCache runs the pipeline on every add)
//!     - depends on: device.rs (measurement accessors), config.rs (ranges)
//!
//! ==============================================================================

use crate::cache::DataEntry;
use crate::config::ValidationConfig;
use crate::device::DeviceReading;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// why a reading was not accepted
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{measurement} rejected ({severity}): {message}")]
pub struct ValidationError {
    pub measurement: String,
    pub prior_value: Option<f64>,
    pub new_value: Option<f64>,
    pub message: String,
    pub severity: Severity,
}

// ==============================================================================
// validator trait
// ==============================================================================

pub trait Validator: Send {
    fn name(&self) -> &'static str;

    /// only validators that understand the reading take part
    fn can_validate(&self, reading: &DeviceReading) -> bool;

    /// `history` is the cached, time ordered sequence for the candidate's
    /// device. the last element is the most recently accepted reading.
    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry)
        -> Result<(), ValidationError>;

    /// forget any state kept between calls
    fn reset(&mut self) {}

    /// forget state kept for one device identity
    fn forget(&mut self, _device: &str) {}
}

// ==============================================================================
// shared rules
// ==============================================================================

/// prior +/- range, with an optional absolute minimum
#[derive(Debug, Clone)]
struct BoundedDelta {
    measurement: &'static str,
    range: f64,
    floor: Option<f64>,
}

impl BoundedDelta {
    fn check(&self, prior: Option<f64>, candidate: Option<f64>) -> Result<(), ValidationError> {
        let (Some(prior), Some(candidate)) = (prior, candidate) else {
            return Ok(());
        };

        let (prior, candidate, min) = match self.floor {
            Some(floor) => {
                let prior = prior.max(floor);
                (prior, candidate.max(floor), (prior - self.range).max(floor))
            }
            None => (prior, candidate, prior - self.range),
        };
        let max = prior + self.range;

        if candidate < min || candidate > max {
            return Err(ValidationError {
                measurement: self.measurement.to_string(),
                prior_value: Some(prior),
                new_value: Some(candidate),
                message: format!(
                    "Value must be between {:.2} and {:.2} (prior {:.2} +/- {})",
                    min, max, prior, self.range
                ),
                severity: Severity::Warning,
            });
        }
        Ok(())
    }
}

/// cumulative counter that may only grow by at most `range`, and only once a
/// grown value repeats
#[derive(Debug, Clone)]
struct ConfirmedIncrease {
    measurement: &'static str,
    range: f64,
    /// last observed value per device identity
    remembered: HashMap<String, f64>,
}

impl ConfirmedIncrease {
    fn new(measurement: &'static str, range: f64) -> Self {
        Self { measurement, range, remembered: HashMap::new() }
    }

    fn check(
        &mut self,
        device: String,
        prior: Option<f64>,
        candidate: Option<f64>,
    ) -> Result<(), ValidationError> {
        let Some(candidate) = candidate else {
            return Ok(());
        };
        let Some(prior) = prior else {
            self.remembered.insert(device, candidate);
            return Ok(());
        };

        let max = prior + self.range;
        if candidate < prior || candidate > max {
            return Err(ValidationError {
                measurement: self.measurement.to_string(),
                prior_value: Some(prior),
                new_value: Some(candidate),
                message: format!("Value must be between {} and {}", prior, max),
                severity: Severity::Warning,
            });
        }

        match self.remembered.insert(device, candidate) {
            Some(last) if last == candidate => Ok(()),
            _ => Err(ValidationError {
                measurement: self.measurement.to_string(),
                prior_value: Some(prior),
                new_value: Some(candidate),
                message: "Must get same value twice in a row before it is considered valid."
                    .to_string(),
                severity: Severity::Info,
            }),
        }
    }
}

fn prior<F>(history: &[DataEntry], measure: F) -> Option<f64>
where
    F: Fn(&DeviceReading) -> Option<f64>,
{
    history.last().and_then(|entry| measure(&entry.reading))
}

// ==============================================================================
// validators
// ==============================================================================

pub struct TemperatureValidator {
    rule: BoundedDelta,
}

impl TemperatureValidator {
    pub fn new(range: f64) -> Self {
        Self {
            rule: BoundedDelta { measurement: "temperature_C", range, floor: None },
        }
    }
}

impl Validator for TemperatureValidator {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn can_validate(&self, reading: &DeviceReading) -> bool {
        reading.temperature().is_some()
    }

    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        self.rule.check(
            prior(history, DeviceReading::temperature),
            candidate.reading.temperature(),
        )
    }
}

pub struct HumidityValidator {
    rule: BoundedDelta,
}

impl HumidityValidator {
    pub fn new(range: f64) -> Self {
        Self {
            rule: BoundedDelta { measurement: "humidity", range, floor: None },
        }
    }
}

impl Validator for HumidityValidator {
    fn name(&self) -> &'static str {
        "humidity"
    }

    fn can_validate(&self, reading: &DeviceReading) -> bool {
        reading.humidity().is_some()
    }

    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        self.rule.check(
            prior(history, DeviceReading::humidity),
            candidate.reading.humidity(),
        )
    }
}

/// food and oven probes of a bbq thermometer. an unplugged probe reports a
/// very low value, so readings are clamped to the floor first.
pub struct ProbeTemperatureValidator {
    food: BoundedDelta,
    oven: BoundedDelta,
}

impl ProbeTemperatureValidator {
    pub fn new(range: f64, floor: f64) -> Self {
        Self {
            food: BoundedDelta { measurement: "temperature_1_C", range, floor: Some(floor) },
            oven: BoundedDelta { measurement: "temperature_2_C", range, floor: Some(floor) },
        }
    }
}

impl Validator for ProbeTemperatureValidator {
    fn name(&self) -> &'static str {
        "probe_temperature"
    }

    fn can_validate(&self, reading: &DeviceReading) -> bool {
        reading.probe_temperatures().is_some()
    }

    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        let (food, oven) = candidate.reading.probe_temperatures().unwrap_or((None, None));
        let (prior_food, prior_oven) = history
            .last()
            .and_then(|entry| entry.reading.probe_temperatures())
            .unwrap_or((None, None));

        self.food.check(prior_food, food)?;
        self.oven.check(prior_oven, oven)
    }
}

pub struct RainValidator {
    rule: ConfirmedIncrease,
}

impl RainValidator {
    pub fn new(range: f64) -> Self {
        Self { rule: ConfirmedIncrease::new("rain_mm", range) }
    }
}

impl Validator for RainValidator {
    fn name(&self) -> &'static str {
        "rain"
    }

    fn can_validate(&self, reading: &DeviceReading) -> bool {
        reading.rain_mm().is_some()
    }

    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        self.rule.check(
            candidate.reading.identity(),
            prior(history, DeviceReading::rain_mm),
            candidate.reading.rain_mm(),
        )
    }

    fn reset(&mut self) {
        self.rule.remembered.clear();
    }

    fn forget(&mut self, device: &str) {
        self.rule.remembered.remove(device);
    }
}

pub struct StrikeCountValidator {
    rule: ConfirmedIncrease,
}

impl StrikeCountValidator {
    pub fn new(range: f64) -> Self {
        Self { rule: ConfirmedIncrease::new("strike_count", range) }
    }
}

impl Validator for StrikeCountValidator {
    fn name(&self) -> &'static str {
        "strike_count"
    }

    fn can_validate(&self, reading: &DeviceReading) -> bool {
        reading.strike_count().is_some()
    }

    fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        self.rule.check(
            candidate.reading.identity(),
            prior(history, DeviceReading::strike_count),
            candidate.reading.strike_count(),
        )
    }

    fn reset(&mut self) {
        self.rule.remembered.clear();
    }

    fn forget(&mut self, device: &str) {
        self.rule.remembered.remove(device);
    }
}

// ==============================================================================
// pipeline
// ==============================================================================

/// ordered validator chain; the first rejection wins
#[derive(Default)]
pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// temperature, humidity, rain, strike count, probe temperature
    pub fn standard(config: &ValidationConfig) -> Self {
        Self::new()
            .with(TemperatureValidator::new(config.temperature_range))
            .with(HumidityValidator::new(config.humidity_range))
            .with(RainValidator::new(config.rain_range))
            .with(StrikeCountValidator::new(config.strike_count_range))
            .with(ProbeTemperatureValidator::new(
                config.probe_range,
                config.probe_floor_c,
            ))
    }

    pub fn with<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn validate(&mut self, history: &[DataEntry], candidate: &DataEntry) -> Result<(), ValidationError> {
        for validator in self.validators.iter_mut() {
            if validator.can_validate(&candidate.reading) {
                validator.validate(history, candidate)?;
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for validator in self.validators.iter_mut() {
            validator.reset();
        }
    }

    /// drops per device state once the device has left the cache
    pub fn forget(&mut self, device: &str) {
        for validator in self.validators.iter_mut() {
            validator.forget(device);
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }
}
