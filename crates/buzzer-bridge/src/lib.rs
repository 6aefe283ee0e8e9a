//! Wireless Buzzer to OSC Bridge
//!
//! This crate turns presses of wireless buzzers, reported line by line by a
//! serial coordinator, into Open Sound Control messages sent over UDP to
//! show-control software (lighting desks, QLab, media servers).
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Coordinator Link** - Serial port, or a simulated coordinator when no
//!    hardware is attached
//! 2. **Line Protocol** - Tolerant parsing of the coordinator's text records
//!    into presses, presence updates and status reports
//! 3. **Routing** - Buzzer → command → target mappings read from an external
//!    configuration store
//! 4. **Dispatch & Activity** - Pooled UDP senders, per-target outcomes, a
//!    durable activity log and live observers
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use buzzer_bridge::{
//!     BridgeConfigBuilder, BuzzerBridge, CoordinatorCommand, JsonLinesLog,
//!     MemoryConfigSource, Transport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .build();
//!
//!     let routes = MemoryConfigSource::from_json_file("routes.json")?;
//!     let log = JsonLinesLog::new("activity.jsonl");
//!
//!     // Falls back to simulation if the port cannot be opened
//!     let transport = Transport::open(&config).await;
//!     let (bridge, handle) =
//!         BuzzerBridge::new(transport, &config, Arc::new(routes), Arc::new(log));
//!     tokio::spawn(bridge.run());
//!
//!     handle.send_command(CoordinatorCommand::Arm(None)).await?;
//!     let mut events = handle.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//!
//! # Press Flow
//!
//! 1. Coordinator prints `BUZZER:<mac>,<epoch_ms>`
//! 2. [`parse_line`] classifies it as a press
//! 3. [`DeviceRegistry`] records the press
//! 4. [`MappingResolver`] looks up active routes for the device
//! 5. [`Dispatcher`] encodes and sends one OSC datagram per route
//! 6. [`ActivitySink`] records and broadcasts every outcome
//!
//! Delivery over UDP is not confirmed: a `Sent` outcome means the local
//! socket accepted the datagram.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod interface;
pub mod protocol;

// State and routing
pub mod devices;
pub mod resolver;
pub mod store;

// Output
pub mod activity;
pub mod dispatch;
pub mod osc;

// Event loop
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use activity::{
    ActivityEvent, ActivityLog, ActivitySink, JsonLinesLog, MemoryActivityLog, NullActivityLog,
};
pub use bridge::{BridgeCommand, BridgeHandle, BridgeStats, BuzzerBridge, PressTask};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, DeviceConfig, InterfaceConfig, ReconnectConfig,
    RuntimeConfig, SimulationConfig,
};
pub use devices::{DeviceRegistry, DeviceState, DeviceView, HeartbeatMark};
pub use dispatch::{DispatchOutcome, Dispatcher, OscSender, OutcomeKind, SenderPool};
pub use error::{BridgeError, Result};
pub use interface::detect::{find_coordinator_port, list_available_devices, DeviceInfo};
pub use interface::{
    ConnectionState, CoordinatorInterface, Link, SimulatedInterface, Transport, TransportMode,
};
pub use osc::{OscArg, OscMessage};
pub use protocol::{
    parse_line, CoordinatorCommand, DiscoveryMode, LineEvent, PresenceUpdate, PressEvent,
    PressSource, StatusKey, StatusReport, StatusValue,
};
pub use resolver::{DispatchInstruction, MappingResolver};
pub use store::{Binding, Command, ConfigSnapshot, ConfigSource, Mapping, MemoryConfigSource, Target};
pub use test_utils::{FailingConfigSource, MockController, MockInterface, RouteFixture};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use config::{DEFAULT_BAUD_RATE, DEFAULT_STALE_AFTER_SECS, MAX_LINE_LENGTH};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(DEFAULT_STALE_AFTER_SECS, 60);
    }
}
