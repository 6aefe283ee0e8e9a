//! Routing configuration consumed by the bridge
//!
//! Bindings, commands, targets and mappings are owned by an external store
//! (the admin layer's database). The bridge only reads them through
//! [`ConfigSource`]. [`MemoryConfigSource`] is the in-process implementation
//! used by the node binary (loaded from a JSON file) and by tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::osc::OscArg;

/// A buzzer registered with the admin layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Record id
    pub id: u64,
    /// Hardware address of the buzzer
    pub device_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether presses from this buzzer are routed
    #[serde(default = "default_active")]
    pub active: bool,
}

/// An OSC message template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Record id
    pub id: u64,
    /// Symbolic name
    pub name: String,
    /// OSC address pattern
    pub address: String,
    /// Arguments, in order
    #[serde(default)]
    pub args: Vec<OscArg>,
    /// Free-form category tag (informational only)
    #[serde(default)]
    pub category: Option<String>,
}

/// An OSC receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Record id
    pub id: u64,
    /// Symbolic name
    pub name: String,
    /// IP address or host name
    pub host: String,
    /// UDP port
    pub port: u16,
    /// Whether the target receives messages
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Target {
    /// Pool identity of this target; names do not participate
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A buzzer → command → target route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Record id
    pub id: u64,
    /// Binding the route belongs to
    pub binding_id: u64,
    /// Command to send
    pub command_id: u64,
    /// Where to send it
    pub target_id: u64,
    /// Whether the route is enabled
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Full routing configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Registered buzzers
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// OSC message templates
    #[serde(default)]
    pub commands: Vec<Command>,
    /// OSC receivers
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Routes
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// Read access to the routing configuration
///
/// Each call returns records in storage order.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// All bindings
    async fn bindings(&self) -> Result<Vec<Binding>>;

    /// All commands
    async fn commands(&self) -> Result<Vec<Command>>;

    /// All targets
    async fn targets(&self) -> Result<Vec<Target>>;

    /// All mappings
    async fn mappings(&self) -> Result<Vec<Mapping>>;
}

/// In-memory routing configuration that can be swapped at run time
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigSource {
    snapshot: Arc<RwLock<ConfigSnapshot>>,
}

impl MemoryConfigSource {
    /// Create from a snapshot
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Load a snapshot from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let snapshot: ConfigSnapshot = serde_json::from_str(&raw)?;
        info!(
            path = %path.as_ref().display(),
            bindings = snapshot.bindings.len(),
            commands = snapshot.commands.len(),
            targets = snapshot.targets.len(),
            mappings = snapshot.mappings.len(),
            "Loaded routing configuration"
        );
        Ok(Self::new(snapshot))
    }

    /// Replace the whole configuration
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.read().clone()
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn bindings(&self) -> Result<Vec<Binding>> {
        Ok(self.snapshot.read().bindings.clone())
    }

    async fn commands(&self) -> Result<Vec<Command>> {
        Ok(self.snapshot.read().commands.clone())
    }

    async fn targets(&self) -> Result<Vec<Target>> {
        Ok(self.snapshot.read().targets.clone())
    }

    async fn mappings(&self) -> Result<Vec<Mapping>> {
        Ok(self.snapshot.read().mappings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_target_address_ignores_name() {
        let a = Target {
            id: 1,
            name: "lighting".to_string(),
            host: "10.0.0.5".to_string(),
            port: 53000,
            active: true,
        };
        let b = Target {
            id: 2,
            name: "sound".to_string(),
            ..a.clone()
        };
        assert_eq!(a.address(), "10.0.0.5:53000");
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_snapshot_defaults_from_json() {
        let json = r#"{
            "bindings": [{ "id": 1, "device_id": "AA:BB" }],
            "commands": [{ "id": 1, "name": "go", "address": "/go" }],
            "targets": [{ "id": 1, "name": "qlab", "host": "127.0.0.1", "port": 53000 }],
            "mappings": [{ "id": 1, "binding_id": 1, "command_id": 1, "target_id": 1 }]
        }"#;
        let snapshot: ConfigSnapshot = serde_json::from_str(json).unwrap();

        assert!(snapshot.bindings[0].active);
        assert!(snapshot.targets[0].active);
        assert!(snapshot.mappings[0].active);
        assert!(snapshot.commands[0].args.is_empty());
    }

    #[tokio::test]
    async fn test_memory_source_from_file_and_replace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "targets": [{{ "id": 9, "name": "t", "host": "localhost", "port": 9000 }}] }}"#
        )
        .unwrap();

        let source = MemoryConfigSource::from_json_file(file.path()).unwrap();
        assert_eq!(source.targets().await.unwrap().len(), 1);
        assert!(source.mappings().await.unwrap().is_empty());

        source.replace(ConfigSnapshot::default());
        assert!(source.targets().await.unwrap().is_empty());
    }
}
