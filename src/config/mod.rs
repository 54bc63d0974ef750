//! Node configuration.
//!
//! Timing of the wake cycle, telemetry destination and BLE identity. Every
//! field has a default matching the field-tested firmware, so an empty JSON
//! object (or no file at all) yields a working node.
//!
//! # Example
//!
//! ```
//! use sensor_node_fw::config::NodeConfig;
//!
//! let config = NodeConfig::from_json(r#"{ "wake_interval_secs": 60 }"#).unwrap();
//! assert_eq!(config.wake_interval().as_secs(), 60);
//! assert_eq!(config.telemetry_topic, "sensor/log");
//! ```

use crate::duty::SensorDutyConfig;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Storage namespace holding every persisted record.
pub const STORE_NAMESPACE: &str = "saved_params";

/// Key of the serialized [`crate::wifi::WirelessCredentials`].
pub const KEY_CREDENTIALS: &str = "saved_wifi";

/// Key of the serialized [`SensorDutyConfig`].
pub const KEY_DUTY_CONFIG: &str = "saved_config";

/// Key of the buffered temperature readings (`i32` little-endian array).
pub const KEY_TEMPERATURES: &str = "saved_temp";

/// Key of the buffered pH readings (`f32` little-endian array).
pub const KEY_PH: &str = "saved_ph";

/// Automatic join retries after the initial attempt fails.
pub const MAX_JOIN_RETRIES: u8 = 2;

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Deep sleep duration between wake cycles.
    pub wake_interval_secs: u64,
    /// How long the Connect phase waits for an address.
    pub connect_timeout_secs: u64,
    /// Length of the telemetry window in the Operate phase.
    pub operate_window_secs: u64,
    /// Pause between two publish attempts inside the window.
    pub send_interval_ms: u64,
    /// Topic every telemetry line is published to.
    pub telemetry_topic: String,
    /// MQTT broker URL (ESP32 only).
    pub broker_url: String,
    /// Name advertised over BLE while provisioning.
    pub device_name: String,
    /// Duty config used until one has been persisted.
    pub duty: DutyDefaults,
}

/// Defaults for the persisted [`SensorDutyConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DutyDefaults {
    pub readings_per_period: u32,
    pub wakeups_before_reading: u32,
}

impl Default for DutyDefaults {
    fn default() -> Self {
        Self {
            readings_per_period: 4,
            wakeups_before_reading: 1,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wake_interval_secs: 20,
            connect_timeout_secs: 20,
            operate_window_secs: 20,
            send_interval_ms: 100,
            telemetry_topic: "sensor/log".to_string(),
            broker_url: "mqtt://broker.local:1883".to_string(),
            device_name: "SensorNode-Setup".to_string(),
            duty: DutyDefaults::default(),
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration is usable and the topic is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("wake_interval_secs", self.wake_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("operate_window_secs", self.operate_window_secs),
            ("send_interval_ms", self.send_interval_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(field));
            }
        }
        if self.telemetry_topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.duty.readings_per_period == 0 {
            return Err(ConfigError::ZeroReadingsPerPeriod);
        }
        Ok(())
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operate_window(&self) -> Duration {
        Duration::from_secs(self.operate_window_secs)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Duty config for a node that has never persisted one.
    pub fn default_duty_config(&self) -> SensorDutyConfig {
        SensorDutyConfig::new(
            self.duty.readings_per_period,
            self.duty.wakeups_before_reading,
        )
    }
}

/// Errors that can occur while loading the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The document is not valid JSON for [`NodeConfig`].
    Parse(String),
    /// A duration field is zero.
    ZeroDuration(&'static str),
    /// Telemetry topic is empty.
    EmptyTopic,
    /// A period needs at least one reading.
    ZeroReadingsPerPeriod,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "invalid configuration: {}", msg),
            Self::ZeroDuration(field) => write!(f, "{} must be greater than zero", field),
            Self::EmptyTopic => write!(f, "telemetry topic cannot be empty"),
            Self::ZeroReadingsPerPeriod => {
                write!(f, "readings_per_period must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wake_interval(), Duration::from_secs(20));
        assert_eq!(config.send_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config =
            NodeConfig::from_json(r#"{ "operate_window_secs": 5, "duty": { "readings_per_period": 8 } }"#)
                .unwrap();
        assert_eq!(config.operate_window(), Duration::from_secs(5));
        assert_eq!(config.duty.readings_per_period, 8);
        assert_eq!(config.duty.wakeups_before_reading, 1);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let result = NodeConfig::from_json(r#"{ "send_interval_ms": 0 }"#);
        assert_eq!(result, Err(ConfigError::ZeroDuration("send_interval_ms")));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let result = NodeConfig::from_json(r#"{ "telemetry_topic": "" }"#);
        assert_eq!(result, Err(ConfigError::EmptyTopic));
    }

    #[test]
    fn test_malformed_json() {
        let result = NodeConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_default_duty_config() {
        let duty = NodeConfig::default().default_duty_config();
        assert_eq!(duty.readings_per_period, 4);
        assert_eq!(duty.readings_done_this_period, 0);
    }
}
