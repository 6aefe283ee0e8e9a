//! Coordinator link implementations
//!
//! The coordinator speaks newline-terminated ASCII. Two link types exist:
//!
//! - [`SerialInterface`] - the physical USB serial port (requires `serial` feature)
//! - [`SimulatedInterface`] - scripted responses for running without hardware
//!
//! [`Transport`] picks one at start-up and swaps between them at run time:
//! a failing serial link drops to simulation, and [`CoordinatorInterface::maintain`]
//! retries the physical port with backoff.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialInterface;

pub mod detect;
mod simulated;
pub use simulated::SimulatedInterface;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
#[cfg(feature = "serial")]
use std::path::PathBuf;
#[cfg(feature = "serial")]
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{BridgeConfig, InterfaceConfig, ReconnectConfig, SimulationConfig};
use crate::error::Result;

/// Trait for coordinator links
///
/// Reads are line oriented. `read_line` must be cancel-safe: the bridge polls
/// it inside `tokio::select!` and drops the future whenever another branch
/// wins.
#[async_trait]
pub trait CoordinatorInterface: Send + Sync {
    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read the next line, without its terminator
    ///
    /// Returns `None` when nothing complete arrived (e.g. a read timeout).
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Write one command line; the terminator is added here
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;

    /// Whether a physical or simulated link is in use
    fn mode(&self) -> TransportMode;

    /// Periodic housekeeping, called from the bridge's maintenance tick
    async fn maintain(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Kind of link currently carrying coordinator traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Physical serial port
    Serial,
    /// Simulation mode
    Simulated,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Serial => write!(f, "serial"),
            TransportMode::Simulated => write!(f, "simulated"),
        }
    }
}

/// Connection state for interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Link currently in use by a [`Transport`]
#[derive(Debug)]
pub enum Link {
    /// Physical serial port
    #[cfg(feature = "serial")]
    Serial(SerialInterface),
    /// Simulation mode
    Simulated(SimulatedInterface),
}

#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
struct PhysicalPort {
    path: PathBuf,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
#[derive(Debug)]
struct ReconnectState {
    attempts: u32,
    next_attempt: Instant,
}

/// Serial link with automatic fallback to simulation
#[derive(Debug)]
pub struct Transport {
    link: Link,
    simulation: SimulationConfig,
    #[cfg_attr(not(feature = "serial"), allow(dead_code))]
    reconnect: ReconnectConfig,
    #[cfg(feature = "serial")]
    physical: Option<PhysicalPort>,
    #[cfg(feature = "serial")]
    retry: Option<ReconnectState>,
}

impl Transport {
    /// Open the configured link
    ///
    /// No configured port, a build without serial support, or a port that
    /// fails to open all yield a simulated link. This never fails.
    pub async fn open(config: &BridgeConfig) -> Self {
        let mut transport = Self {
            link: Link::Simulated(SimulatedInterface::from_config(&config.simulation)),
            simulation: config.simulation.clone(),
            reconnect: config.reconnect.clone(),
            #[cfg(feature = "serial")]
            physical: None,
            #[cfg(feature = "serial")]
            retry: None,
        };

        match &config.interface {
            InterfaceConfig::Simulated => {
                info!("No serial port configured, running in simulation mode");
            }
            #[cfg(feature = "serial")]
            InterfaceConfig::Serial { port, baud_rate } => {
                transport.physical = Some(PhysicalPort {
                    path: port.clone(),
                    baud_rate: *baud_rate,
                });
                if let Err(e) = transport.try_physical().await {
                    warn!(port = %port.display(), error = %e, "Serial port unavailable, running in simulation mode");
                    transport.schedule_retry();
                }
            }
            #[cfg(not(feature = "serial"))]
            InterfaceConfig::Serial { port, .. } => {
                warn!(
                    port = %port.display(),
                    "Built without serial support, running in simulation mode"
                );
            }
        }

        if let Link::Simulated(sim) = &mut transport.link {
            // Simulated connect cannot fail
            let _ = sim.connect().await;
        }
        transport
    }

    /// Start directly in simulation mode
    pub fn simulated(simulation: &SimulationConfig) -> Self {
        Self {
            link: Link::Simulated(SimulatedInterface::from_config(simulation).connected()),
            simulation: simulation.clone(),
            reconnect: ReconnectConfig::default(),
            #[cfg(feature = "serial")]
            physical: None,
            #[cfg(feature = "serial")]
            retry: None,
        }
    }

    /// Link currently in use
    pub fn link(&self) -> &Link {
        &self.link
    }

    fn inner(&mut self) -> &mut dyn CoordinatorInterface {
        match &mut self.link {
            #[cfg(feature = "serial")]
            Link::Serial(serial) => serial,
            Link::Simulated(sim) => sim,
        }
    }

    fn inner_ref(&self) -> &dyn CoordinatorInterface {
        match &self.link {
            #[cfg(feature = "serial")]
            Link::Serial(serial) => serial,
            Link::Simulated(sim) => sim,
        }
    }

    #[cfg(feature = "serial")]
    async fn try_physical(&mut self) -> Result<()> {
        let Some(port) = self.physical.clone() else {
            return Ok(());
        };
        let mut serial = SerialInterface::new(&port.path).with_baud_rate(port.baud_rate);
        serial.connect().await?;
        let _ = self.inner().disconnect().await;
        self.link = Link::Serial(serial);
        self.retry = None;
        Ok(())
    }

    #[cfg(feature = "serial")]
    fn schedule_retry(&mut self) {
        let attempts = self.retry.as_ref().map_or(0, |r| r.attempts);
        let delay = self.reconnect.delay_for_attempt(attempts);
        self.retry = Some(ReconnectState {
            attempts,
            next_attempt: Instant::now() + delay,
        });
    }

    /// Drop to simulation after a physical link failure
    async fn fall_back(&mut self, error: &crate::error::BridgeError) {
        warn!(
            link = self.inner_ref().name(),
            error = %error,
            code = error.error_code(),
            "Coordinator link failed, switching to simulation mode"
        );
        let _ = self.inner().disconnect().await;
        let sim = SimulatedInterface::from_config(&self.simulation).connected();
        self.link = Link::Simulated(sim);
        #[cfg(feature = "serial")]
        self.schedule_retry();
    }
}

#[async_trait]
impl CoordinatorInterface for Transport {
    async fn connect(&mut self) -> Result<()> {
        if self.inner_ref().is_connected() {
            return Ok(());
        }
        if let Err(e) = self.inner().connect().await {
            self.fall_back(&e).await;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.inner().disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner_ref().is_connected()
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.inner().read_line().await {
            Ok(line) => Ok(line),
            Err(e) if self.mode() == TransportMode::Serial => {
                self.fall_back(&e).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        match self.inner().write_line(line).await {
            Ok(()) => Ok(()),
            Err(e) if self.mode() == TransportMode::Serial => {
                self.fall_back(&e).await;
                // The command still gets an answer
                self.inner().write_line(line).await
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        self.inner_ref().name()
    }

    fn mode(&self) -> TransportMode {
        self.inner_ref().mode()
    }

    #[cfg(feature = "serial")]
    async fn maintain(&mut self) -> Result<()> {
        if self.mode() == TransportMode::Serial {
            return Ok(());
        }
        let Some(retry) = &self.retry else {
            return Ok(());
        };
        if !self.reconnect.allows_attempt(retry.attempts) || Instant::now() < retry.next_attempt {
            return Ok(());
        }

        let attempts = retry.attempts + 1;
        match self.try_physical().await {
            Ok(()) => {
                info!(attempts, link = self.name(), "Serial port reconnected");
            }
            Err(e) => {
                warn!(attempts, error = %e, "Serial reconnect failed");
                self.retry = Some(ReconnectState {
                    attempts,
                    next_attempt: Instant::now(),
                });
                self.schedule_retry();
            }
        }
        Ok(())
    }
}
