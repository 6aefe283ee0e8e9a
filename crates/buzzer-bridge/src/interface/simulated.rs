//! Simulated coordinator
//!
//! Answers outbound commands with the same lines a real coordinator would
//! print, after a short delay, so the rest of the bridge runs unchanged
//! without hardware.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, CoordinatorInterface, TransportMode};

/// Scripted stand-in for the coordinator
#[derive(Debug)]
pub struct SimulatedInterface {
    /// Lines waiting to be read, with the instant they become readable
    pending: VecDeque<(Instant, String)>,
    /// Simulated arm state
    armed: bool,
    /// Simulated buzzer addresses
    devices: Vec<String>,
    /// Response delay
    delay: Duration,
    state: ConnectionState,
}

impl SimulatedInterface {
    /// Create with explicit devices and delay
    pub fn new(devices: Vec<String>, delay: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            armed: false,
            devices,
            delay,
            state: ConnectionState::Disconnected,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.devices.clone(), config.response_delay)
    }

    /// Mark as connected without going through `connect`
    pub fn connected(mut self) -> Self {
        self.state = ConnectionState::Connected;
        self
    }

    /// Whether the simulated coordinator is armed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Number of lines not yet read
    pub fn pending_lines(&self) -> usize {
        self.pending.len()
    }

    /// Queue an arbitrary coordinator line, e.g. a scripted `BUZZER:` press
    pub fn inject_line(&mut self, line: impl Into<String>) {
        self.queue(line.into());
    }

    fn queue(&mut self, line: String) {
        // Keep FIFO order even if the delay changes between calls
        let base = Instant::now() + self.delay;
        let at = match self.pending.back() {
            Some((last, _)) if *last > base => *last,
            _ => base,
        };
        self.pending.push_back((at, line));
    }

    fn device_lines(&self) -> Vec<String> {
        let armed = u8::from(self.armed);
        self.devices
            .iter()
            .map(|mac| format!("DEVICE:{},online=1,armed={},pressed=0", mac, armed))
            .collect()
    }

    fn respond(&mut self, command: &str) {
        let mut lines = Vec::new();
        match command {
            "STATUS" => lines.push(format!(
                "STATUS:armed={},devices={},mode=simulation",
                u8::from(self.armed),
                self.devices.len()
            )),
            "SCAN" => {
                lines.push("ACK:SCAN".to_string());
                lines.extend(self.device_lines());
            }
            "DISARM" => {
                self.armed = false;
                lines.push("ACK:DISARM".to_string());
                lines.extend(self.device_lines());
            }
            cmd if cmd.starts_with("ARM") => {
                self.armed = true;
                lines.push(format!("ACK:{}", cmd));
                lines.extend(self.device_lines());
            }
            other => lines.push(format!("ERROR:Unknown command: {}", other)),
        }

        debug!(command, responses = lines.len(), "Simulated coordinator response");
        for line in lines {
            self.queue(line);
        }
    }
}

#[async_trait]
impl CoordinatorInterface for SimulatedInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Connected;
            info!(devices = self.devices.len(), "Simulation mode active");
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state = ConnectionState::Disconnected;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let Some((at, _)) = self.pending.front() else {
            // Nothing scheduled; the bridge's other branches keep running
            return std::future::pending().await;
        };
        tokio::time::sleep_until(*at).await;
        Ok(self.pending.pop_front().map(|(_, line)| line))
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        self.respond(line.trim());
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Simulated
    }
}
