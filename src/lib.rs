//! omg-filter: filters and throttles OpenMQTTGateway / rtl_433 sensor
//! telemetry between the gateways and the downstream broker.
//!
//! the binary in `main.rs` wires these modules to a real broker. tests and the
//! `replay` binary use the in-memory transport instead.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod forwarder;
pub mod replay;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod topic;
pub mod transport;
pub mod validation;

pub use config::FilterConfig;
pub use device::{DeviceReading, MqttMessage};
pub use error::{FilterError, TopicError};
pub use runtime::FilterRuntime;
