//! Test utilities
//!
//! Helpers for exercising the bridge without hardware or a real
//! configuration store:
//!
//! - [`MockInterface`] - a coordinator link driven from test code
//! - [`RouteFixture`] - builds routing configurations one route at a time
//! - [`FailingConfigSource`] - a configuration store that is always down
//!
//! # Example
//!
//! ```rust,ignore
//! let (interface, controller) = MockInterface::new();
//! let (bridge, handle) = BuzzerBridge::new(interface, &config, source, log);
//! tokio::spawn(bridge.run());
//!
//! controller.push_line("BUZZER:AA:BB:CC:DD:EE:FF,1700000000000");
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};
use crate::interface::{CoordinatorInterface, TransportMode};
use crate::osc::OscArg;
use crate::store::{Binding, Command, ConfigSnapshot, ConfigSource, Mapping, Target};

/// Coordinator link fed by a [`MockController`]
pub struct MockInterface {
    connected: bool,
    fail_connect: bool,
    incoming: mpsc::UnboundedReceiver<String>,
    written: Arc<Mutex<Vec<String>>>,
}

/// Test-side end of a [`MockInterface`]
#[derive(Clone)]
pub struct MockController {
    incoming: mpsc::UnboundedSender<String>,
    written: Arc<Mutex<Vec<String>>>,
}

impl MockInterface {
    /// Create a mock link and its controller
    pub fn new() -> (Self, MockController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let interface = Self {
            connected: false,
            fail_connect: false,
            incoming: rx,
            written: written.clone(),
        };
        let controller = MockController {
            incoming: tx,
            written,
        };
        (interface, controller)
    }

    /// Make `connect` fail, like an unplugged port
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

impl MockController {
    /// Deliver a line as if the coordinator printed it
    pub fn push_line(&self, line: impl Into<String>) {
        let _ = self.incoming.send(line.into());
    }

    /// Commands written to the link so far
    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl CoordinatorInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(BridgeError::PortNotFound("mock".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(line) => Ok(Some(line)),
            // Controller gone: behave like a silent coordinator
            None => std::future::pending().await,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.connected {
            return Err(BridgeError::Disconnected);
        }
        self.written.lock().push(line.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Serial
    }
}

/// Builder for routing configurations
///
/// Each `route` call adds a binding (reused per device), a command, a target
/// and the mapping tying them together.
#[derive(Debug, Default)]
pub struct RouteFixture {
    snapshot: ConfigSnapshot,
}

impl RouteFixture {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(len: usize) -> u64 {
        len as u64 + 1
    }

    /// Route `device_id` to send `address` with `args` to `host:port`
    pub fn route(
        mut self,
        device_id: &str,
        address: &str,
        args: Vec<OscArg>,
        target_name: &str,
        host: &str,
        port: u16,
    ) -> Self {
        let binding_id = match self
            .snapshot
            .bindings
            .iter()
            .find(|b| b.device_id == device_id)
        {
            Some(binding) => binding.id,
            None => {
                let id = Self::next_id(self.snapshot.bindings.len());
                self.snapshot.bindings.push(Binding {
                    id,
                    device_id: device_id.to_string(),
                    name: format!("buzzer {}", id),
                    active: true,
                });
                id
            }
        };

        let command_id = Self::next_id(self.snapshot.commands.len());
        self.snapshot.commands.push(Command {
            id: command_id,
            name: format!("cmd{}", command_id),
            address: address.to_string(),
            args,
            category: None,
        });

        let target_id = Self::next_id(self.snapshot.targets.len());
        self.snapshot.targets.push(Target {
            id: target_id,
            name: target_name.to_string(),
            host: host.to_string(),
            port,
            active: true,
        });

        let mapping_id = Self::next_id(self.snapshot.mappings.len());
        self.snapshot.mappings.push(Mapping {
            id: mapping_id,
            binding_id,
            command_id,
            target_id,
            active: true,
        });
        self
    }

    /// The configuration built so far
    pub fn build(self) -> ConfigSnapshot {
        self.snapshot
    }
}

/// Configuration store whose every query fails
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingConfigSource;

fn unavailable<T>() -> Result<T> {
    Err(BridgeError::ConfigQuery("store unavailable".to_string()))
}

#[async_trait]
impl ConfigSource for FailingConfigSource {
    async fn bindings(&self) -> Result<Vec<Binding>> {
        unavailable()
    }

    async fn commands(&self) -> Result<Vec<Command>> {
        unavailable()
    }

    async fn targets(&self) -> Result<Vec<Target>> {
        unavailable()
    }

    async fn mappings(&self) -> Result<Vec<Mapping>> {
        unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_fixture_reuses_binding() {
        let snapshot = RouteFixture::new()
            .route("AA", "/a", vec![], "t1", "127.0.0.1", 9000)
            .route("AA", "/b", vec![OscArg::Int(1)], "t2", "127.0.0.1", 9001)
            .route("BB", "/c", vec![], "t3", "127.0.0.1", 9002)
            .build();

        assert_eq!(snapshot.bindings.len(), 2);
        assert_eq!(snapshot.mappings.len(), 3);
        assert_eq!(snapshot.mappings[1].binding_id, 1);
        assert_eq!(snapshot.mappings[2].binding_id, 2);
    }

    #[tokio::test]
    async fn test_mock_interface_round_trip() {
        let (mut interface, controller) = MockInterface::new();
        interface.connect().await.unwrap();

        controller.push_line("ACK:SCAN");
        assert_eq!(interface.read_line().await.unwrap().as_deref(), Some("ACK:SCAN"));

        interface.write_line("STATUS").await.unwrap();
        assert_eq!(controller.written(), vec!["STATUS"]);
    }
}
