//! Configuration types for the buzzer bridge
//!
//! This module provides configuration structures for the coordinator link
//! (serial or simulated), device staleness, simulation behaviour, reconnect
//! backoff and the bridge event loop.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default baud rate for the coordinator's serial console
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default serial read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default staleness window for device presence
pub const DEFAULT_STALE_AFTER_SECS: u64 = 60;

/// Longest line accepted from the coordinator before it is discarded
pub const MAX_LINE_LENGTH: usize = 1024;

/// Default delay before simulated coordinator responses are delivered
pub const DEFAULT_SIMULATION_DELAY_MS: u64 = 50;

/// Default capacity of the activity log queue
pub const DEFAULT_LOG_QUEUE_SIZE: usize = 1024;

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Coordinator link configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Device presence settings
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Simulation mode settings
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Event loop settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl BridgeConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot constrain
    pub fn validate(&self) -> Result<()> {
        if self.devices.stale_after.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "devices.stale_after must be greater than zero".to_string(),
            ));
        }
        if self.runtime.command_queue_size == 0
            || self.runtime.event_buffer == 0
            || self.runtime.log_queue_size == 0
        {
            return Err(BridgeError::InvalidConfig(
                "runtime queue sizes must be greater than zero".to_string(),
            ));
        }
        if self.runtime.maintenance_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "runtime.maintenance_interval must be greater than zero".to_string(),
            ));
        }
        if let InterfaceConfig::Serial { baud_rate, .. } = &self.interface {
            if *baud_rate == 0 {
                return Err(BridgeError::InvalidConfig(
                    "serial baud_rate must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// How the bridge reaches the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Serial port connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// No physical link; run in simulation mode
    Simulated,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Simulated
    }
}

/// Device presence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// A device not heard from for longer than this is reported offline
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
}

fn default_stale_after() -> Duration {
    Duration::from_secs(DEFAULT_STALE_AFTER_SECS)
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
        }
    }
}

/// Simulation mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Delay before a simulated response line becomes readable
    #[serde(with = "humantime_serde", default = "default_simulation_delay")]
    pub response_delay: Duration,

    /// Hardware addresses of the simulated buzzers
    #[serde(default = "default_simulated_devices")]
    pub devices: Vec<String>,
}

fn default_simulation_delay() -> Duration {
    Duration::from_millis(DEFAULT_SIMULATION_DELAY_MS)
}

fn default_simulated_devices() -> Vec<String> {
    vec![
        "AA:BB:CC:00:00:01".to_string(),
        "AA:BB:CC:00:00:02".to_string(),
        "AA:BB:CC:00:00:03".to_string(),
    ]
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            response_delay: default_simulation_delay(),
            devices: default_simulated_devices(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection to the physical port
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl ReconnectConfig {
    /// Backoff delay before the given (zero-based) attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts < self.max_attempts)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Infinite
        }
    }
}

/// Bridge event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of the administrative command queue
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,

    /// Capacity of the live event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Capacity of the activity log queue; entries beyond it are dropped
    #[serde(default = "default_log_queue_size")]
    pub log_queue_size: usize,

    /// Interval of the maintenance tick (reconnect attempts)
    #[serde(with = "humantime_serde", default = "default_maintenance_interval")]
    pub maintenance_interval: Duration,
}

fn default_command_queue_size() -> usize {
    256
}

fn default_event_buffer() -> usize {
    256
}

fn default_log_queue_size() -> usize {
    DEFAULT_LOG_QUEUE_SIZE
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_queue_size: default_command_queue_size(),
            event_buffer: default_event_buffer(),
            log_queue_size: default_log_queue_size(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Set baud rate (only meaningful for a serial interface)
    pub fn baud_rate(mut self, baud: u32) -> Self {
        if let InterfaceConfig::Serial { baud_rate, .. } = &mut self.config.interface {
            *baud_rate = baud;
        }
        self
    }

    /// Run without a physical link
    pub fn simulated(mut self) -> Self {
        self.config.interface = InterfaceConfig::Simulated;
        self
    }

    /// Set the staleness window
    pub fn stale_after(mut self, window: Duration) -> Self {
        self.config.devices.stale_after = window;
        self
    }

    /// Set the simulated response delay
    pub fn simulation_delay(mut self, delay: Duration) -> Self {
        self.config.simulation.response_delay = delay;
        self
    }

    /// Replace the simulated device list
    pub fn simulated_devices<S: Into<String>>(mut self, devices: impl IntoIterator<Item = S>) -> Self {
        self.config.simulation.devices = devices.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set the maintenance tick interval
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.runtime.maintenance_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(matches!(config.interface, InterfaceConfig::Simulated));
        assert_eq!(config.devices.stale_after, Duration::from_secs(60));
        assert!(config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .serial_port("/dev/ttyACM0")
            .baud_rate(9600)
            .stale_after(Duration::from_secs(30))
            .auto_reconnect(false)
            .build();

        match config.interface {
            InterfaceConfig::Serial { port, baud_rate } => {
                assert_eq!(port, PathBuf::from("/dev/ttyACM0"));
                assert_eq!(baud_rate, 9600);
            }
            InterfaceConfig::Simulated => panic!("expected serial interface"),
        }
        assert_eq!(config.devices.stale_after, Duration::from_secs(30));
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_parse_json_with_humantime() {
        let json = r#"{
            "interface": { "type": "serial", "port": "/dev/ttyUSB1" },
            "devices": { "stale_after": "90s" },
            "simulation": { "response_delay": "10ms", "devices": ["11:22:33:44:55:66"] }
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.devices.stale_after, Duration::from_secs(90));
        assert_eq!(config.simulation.response_delay, Duration::from_millis(10));
        assert_eq!(config.simulation.devices, vec!["11:22:33:44:55:66"]);
        match config.interface {
            InterfaceConfig::Serial { baud_rate, .. } => assert_eq!(baud_rate, DEFAULT_BAUD_RATE),
            InterfaceConfig::Simulated => panic!("expected serial interface"),
        }
    }

    #[test]
    fn test_zero_staleness_rejected() {
        let config = BridgeConfigBuilder::new().stale_after(Duration::ZERO).build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_maintenance_interval_rejected() {
        let config = BridgeConfigBuilder::new()
            .maintenance_interval(Duration::ZERO)
            .build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));

        let parsed: BridgeConfig =
            serde_json::from_str(r#"{"runtime":{"maintenance_interval":"0s"}}"#).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_reconnect_backoff() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(reconnect.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(reconnect.delay_for_attempt(30), Duration::from_secs(60));
        assert!(reconnect.allows_attempt(1000));

        let limited = ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::default()
        };
        assert!(limited.allows_attempt(1));
        assert!(!limited.allows_attempt(2));
    }
}
