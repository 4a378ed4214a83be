//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `filter.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (handy in containers).
//!
//! structure:
//!     - MqttConfig: broker address and credentials.
//!     - TopicsConfig: ingest pattern and publish pattern.
//!     - ValidationConfig: allowed change per measurement.
//!     - ThrottleConfig: publish interval and the hot probe override.
//!     - CacheConfig / StoreConfig: retention and housekeeping.
//!     - ApiConfig / LoggingConfig.
//!
//! all durations are in seconds.
//!
//! ==============================================================================

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub mqtt: MqttConfig,
    pub topics: TopicsConfig,
    pub validation: ValidationConfig,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// a random suffix is appended per process
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: None,
            pass: None,
            client_id_prefix: "omg-filter".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TopicsConfig {
    /// where the gateways publish raw decodes
    pub src: String,
    /// where filtered readings are republished
    pub dst: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            src: "433_direct/raw/+/RTL_433toMQTT/#".to_string(),
            dst: "433_direct/+/RTL_433toMQTT/#".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub temperature_range: f64,
    pub humidity_range: f64,
    pub probe_range: f64,
    /// unplugged probes read below this; 0 F
    pub probe_floor_c: f64,
    pub rain_range: f64,
    pub strike_count_range: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            temperature_range: 2.5,
            humidity_range: 10.0,
            probe_range: 30.0,
            probe_floor_c: -17.7778,
            rain_range: 15.0,
            strike_count_range: 5.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub default_interval_secs: u64,
    /// probes at or above this temperature publish faster
    pub probe_threshold_c: f64,
    pub probe_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 60,
            probe_threshold_c: 150.0,
            probe_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_age_secs: 300, cleanup_interval_secs: 60 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub path: String,
    pub retention_days: i64,
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data/messages.jsonl".to_string(),
            retention_days: 7,
            purge_interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, port: 3000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl FilterConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: FilterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("filter.toml"),
            std::path::PathBuf::from("..").join("config").join("filter.toml"),
        ];

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: {:#}", e);
                    }
                }
            }
        }

        let mut config = config.unwrap_or_else(|| {
            println!("[CONFIG] Warning: No config file found - using defaults");
            Self::default()
        });
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// environment wins over the file. `lookup` is `std::env::var` outside
    /// of tests.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => println!("[CONFIG] Warning: ignoring invalid MQTT_PORT '{}'", port),
            }
        }
        if let Some(user) = var("MQTT_USER") {
            self.mqtt.user = Some(user);
        }
        if let Some(pass) = var("MQTT_PASS") {
            self.mqtt.pass = Some(pass);
        }
        if let Some(src) = var("MQTT_SRC_TOPIC") {
            self.topics.src = src;
        }
        if let Some(dst) = var("MQTT_DST_TOPIC") {
            self.topics.dst = dst;
        }
        if let Some(port) = var("API_PORT") {
            match port.parse() {
                Ok(port) => self.api.port = port,
                Err(_) => println!("[CONFIG] Warning: ignoring invalid API_PORT '{}'", port),
            }
        }
        if let Some(path) = var("STORE_PATH") {
            self.store.path = path;
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          FILTER CONFIGURATION           │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Broker: {}:{}", self.mqtt.host, self.mqtt.port);
        println!("│ Source: {}", self.topics.src);
        println!("│ Destination: {}", self.topics.dst);
        println!("│ Throttle: {}s (probes >= {}C: {}s)",
            self.throttle.default_interval_secs,
            self.throttle.probe_threshold_c,
            self.throttle.probe_interval_secs);
        println!("│ Cache Max Age: {}s", self.cache.max_age_secs);
        if self.store.enabled {
            println!("│ Store: {} ({} days)", self.store.path, self.store.retention_days);
        } else {
            println!("│ Store: disabled");
        }
        if self.api.enabled {
            println!("│ API Port: {}", self.api.port);
        }
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
