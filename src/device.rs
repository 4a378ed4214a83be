//! ==============================================================================
//! device.rs - sensor payload model and device identity
//! ==============================================================================
//!
//! purpose:
//!     defines the closed set of rtl_433 / OpenMQTTGateway payload shapes the
//!     filter understands, and derives a stable identity key for each physical
//!     sensor signal.
//!
//! relationships:
//!     - used by: validation (measurement accessors), cache (entries),
//!       runtime (classifying inbound payloads), forwarder (probe throttle)
//!     - depends on: nothing but serde_json
//!
//! identity rules:
//!     base key is "<model>:<id>"
//!     - 5n1 appends the message type (one radio module sends two signals)
//!     - tower and 5n1 prefix the channel
//!     - pro-in prefixes the probe subtype
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 5n1 message carrying wind speed, temperature and humidity
pub const MSG_TYPE_SPEED_AND_TEMP: i64 = 56;
/// 5n1 message carrying wind speed, direction and rain total
pub const MSG_TYPE_WIND_AND_RAIN: i64 = 49;

/// pro-in subtype used when the payload omits it
const DEFAULT_PRO_IN_SUBTYPE: &str = "0";

// ==============================================================================
// raw mqtt message
// ==============================================================================

/// a message as received from, or sent to, the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub topic: String,
    /// payload text exactly as it will be published
    pub message: String,
    /// parsed payload, when the text was valid json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MqttMessage {
    /// wraps raw text, parsing it when possible
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let data = serde_json::from_str(&message).ok();
        Self { topic: topic.into(), message, data }
    }

    /// builds a message from an already parsed payload
    pub fn from_data(topic: impl Into<String>, data: Value) -> Self {
        Self { topic: topic.into(), message: data.to_string(), data: Some(data) }
    }

    /// numeric `rssi` field of the parsed payload, if any
    pub fn rssi(&self) -> Option<f64> {
        self.data.as_ref()?.get("rssi")?.as_f64()
    }

    /// overwrites `rssi` and keeps the payload text in sync
    pub fn set_rssi(&mut self, rssi: f64) {
        if let Some(Value::Object(map)) = self.data.as_mut() {
            let value = serde_json::Number::from_f64(rssi)
                .map(|n| {
                    // keep integers looking like integers on the wire
                    if rssi.fract() == 0.0 && rssi.abs() < i64::MAX as f64 {
                        Value::from(rssi as i64)
                    } else {
                        Value::Number(n)
                    }
                })
                .unwrap_or(Value::Null);
            map.insert("rssi".to_string(), value);
            self.message = Value::Object(map.clone()).to_string();
        }
    }
}

// ==============================================================================
// known device models
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceModel {
    AcuriteTower,
    Acurite5n1,
    AcuriteProIn,
    AcuriteLightning,
    MaverickEt73,
}

impl DeviceModel {
    /// recognizes the model strings emitted by rtl_433 decoders
    pub fn from_model(model: &str) -> Option<Self> {
        match model {
            "Acurite-Tower" | "Tower" => Some(Self::AcuriteTower),
            "Acurite-5n1" | "5n1" => Some(Self::Acurite5n1),
            "Acurite-00276rm" | "00276rm" => Some(Self::AcuriteProIn),
            "Acurite-6045M" | "6045M" => Some(Self::AcuriteLightning),
            "Maverick-ET73" | "Maverick-ET73x" | "ET73" => Some(Self::MaverickEt73),
            _ => None,
        }
    }
}

// ==============================================================================
// device reading
// ==============================================================================

/// a parsed reading from one known sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    /// radio identifier, always a string even when the wire carried a number
    pub id: String,
    /// model string as received
    pub model: String,
    pub rssi: Option<f64>,
    pub battery_ok: Option<i64>,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    Tower {
        channel: String,
        temperature_c: Option<f64>,
        humidity: Option<f64>,
    },
    FiveInOne {
        channel: String,
        message: FiveInOneMessage,
    },
    ProIn {
        subtype: String,
        temperature_c: Option<f64>,
        humidity: Option<f64>,
        water: Option<i64>,
    },
    Lightning {
        channel: Option<String>,
        temperature_c: Option<f64>,
        humidity: Option<f64>,
        strike_count: Option<f64>,
        storm_dist: Option<f64>,
        active: Option<i64>,
        rfi: Option<i64>,
        exception: Option<i64>,
    },
    /// dual probe bbq thermometer
    Probe {
        food_c: Option<f64>,
        oven_c: Option<f64>,
    },
}

/// the two signals sent by an acurite 5n1 weather station
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FiveInOneMessage {
    SpeedAndTemp {
        wind_avg_km_h: Option<f64>,
        temperature_c: Option<f64>,
        humidity: Option<f64>,
    },
    WindAndRain {
        wind_avg_km_h: Option<f64>,
        wind_dir_deg: Option<f64>,
        rain_mm: Option<f64>,
    },
    Other {
        message_type: Option<i64>,
    },
}

impl FiveInOneMessage {
    pub fn message_type(&self) -> Option<i64> {
        match self {
            Self::SpeedAndTemp { .. } => Some(MSG_TYPE_SPEED_AND_TEMP),
            Self::WindAndRain { .. } => Some(MSG_TYPE_WIND_AND_RAIN),
            Self::Other { message_type } => *message_type,
        }
    }
}

/// is this loosely typed payload a device we understand?
pub fn is_known_device(value: &Value) -> bool {
    identifier(value).is_some()
        && value
            .get("model")
            .and_then(Value::as_str)
            .and_then(DeviceModel::from_model)
            .is_some()
}

impl DeviceReading {
    /// parses a json payload, `None` when it is not a known device
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = identifier(value)?;
        let model = value.get("model")?.as_str()?.to_string();
        let known = DeviceModel::from_model(&model)?;

        let kind = match known {
            DeviceModel::AcuriteTower => DeviceKind::Tower {
                channel: text(value, "channel").unwrap_or_default(),
                temperature_c: number(value, "temperature_C"),
                humidity: number(value, "humidity"),
            },
            DeviceModel::Acurite5n1 => {
                let message = match integer(value, "message_type") {
                    Some(MSG_TYPE_SPEED_AND_TEMP) => FiveInOneMessage::SpeedAndTemp {
                        wind_avg_km_h: number(value, "wind_avg_km_h"),
                        temperature_c: number(value, "temperature_C"),
                        humidity: number(value, "humidity"),
                    },
                    Some(MSG_TYPE_WIND_AND_RAIN) => FiveInOneMessage::WindAndRain {
                        wind_avg_km_h: number(value, "wind_avg_km_h"),
                        wind_dir_deg: number(value, "wind_dir_deg"),
                        rain_mm: number(value, "rain_mm"),
                    },
                    other => FiveInOneMessage::Other { message_type: other },
                };
                DeviceKind::FiveInOne {
                    channel: text(value, "channel").unwrap_or_default(),
                    message,
                }
            }
            DeviceModel::AcuriteProIn => DeviceKind::ProIn {
                subtype: text(value, "subtype")
                    .unwrap_or_else(|| DEFAULT_PRO_IN_SUBTYPE.to_string()),
                temperature_c: number(value, "temperature_C"),
                humidity: number(value, "humidity"),
                water: integer(value, "water"),
            },
            DeviceModel::AcuriteLightning => DeviceKind::Lightning {
                channel: text(value, "channel"),
                temperature_c: number(value, "temperature_C"),
                humidity: number(value, "humidity"),
                strike_count: number(value, "strike_count"),
                storm_dist: number(value, "storm_dist"),
                active: integer(value, "active"),
                rfi: integer(value, "rfi"),
                exception: integer(value, "exception"),
            },
            DeviceModel::MaverickEt73 => DeviceKind::Probe {
                food_c: number(value, "temperature_1_C"),
                oven_c: number(value, "temperature_2_C"),
            },
        };

        Some(Self {
            id,
            model,
            rssi: number(value, "rssi"),
            battery_ok: integer(value, "battery_ok"),
            kind,
        })
    }

    /// stable key grouping every reading of one physical sensor signal
    pub fn identity(&self) -> String {
        let base = format!("{}:{}", self.model, self.id);
        match &self.kind {
            DeviceKind::Tower { channel, .. } => format!("{}:{}", channel, base),
            DeviceKind::FiveInOne { channel, message } => {
                let message_type = message
                    .message_type()
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                format!("{}:{}:{}", channel, base, message_type)
            }
            DeviceKind::ProIn { subtype, .. } => format!("{}:{}", subtype, base),
            DeviceKind::Lightning { .. } | DeviceKind::Probe { .. } => base,
        }
    }

    pub fn temperature(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::Tower { temperature_c, .. }
            | DeviceKind::ProIn { temperature_c, .. }
            | DeviceKind::Lightning { temperature_c, .. } => *temperature_c,
            DeviceKind::FiveInOne {
                message: FiveInOneMessage::SpeedAndTemp { temperature_c, .. },
                ..
            } => *temperature_c,
            DeviceKind::FiveInOne { .. } | DeviceKind::Probe { .. } => None,
        }
    }

    pub fn humidity(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::Tower { humidity, .. }
            | DeviceKind::ProIn { humidity, .. }
            | DeviceKind::Lightning { humidity, .. } => *humidity,
            DeviceKind::FiveInOne {
                message: FiveInOneMessage::SpeedAndTemp { humidity, .. },
                ..
            } => *humidity,
            DeviceKind::FiveInOne { .. } | DeviceKind::Probe { .. } => None,
        }
    }

    /// cumulative rain total, 5n1 wind & rain messages only
    pub fn rain_mm(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::FiveInOne {
                message: FiveInOneMessage::WindAndRain { rain_mm, .. },
                ..
            } => *rain_mm,
            _ => None,
        }
    }

    /// cumulative lightning strike counter
    pub fn strike_count(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::Lightning { strike_count, .. } => *strike_count,
            _ => None,
        }
    }

    /// (food, oven) probe temperatures
    pub fn probe_temperatures(&self) -> Option<(Option<f64>, Option<f64>)> {
        match &self.kind {
            DeviceKind::Probe { food_c, oven_c } => Some((*food_c, *oven_c)),
            _ => None,
        }
    }

    pub fn is_five_in_one(&self, message_type: i64) -> bool {
        matches!(&self.kind, DeviceKind::FiveInOne { message, .. } if message.message_type() == Some(message_type))
    }
}

// ==============================================================================
// field helpers
// ==============================================================================

/// `id` may arrive as a string or a number
fn identifier(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: &Value, field: &str) -> Option<f64> {
    value.get(field)?.as_f64()
}

fn integer(value: &Value, field: &str) -> Option<i64> {
    let v = value.get(field)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}
