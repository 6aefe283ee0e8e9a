//! Mapping resolution
//!
//! Turns a buzzer hardware address into the list of OSC sends it triggers.
//! A route is live only when its binding, its target and the mapping itself
//! are all active. Routes whose command or target no longer exists are
//! skipped with a warning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::osc::OscArg;
use crate::store::{Command, ConfigSource, Target};

/// One fully-resolved send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchInstruction {
    /// Mapping that produced this send (`None` for test sends)
    pub mapping_id: Option<u64>,
    /// Command name, for logging
    pub command_name: String,
    /// OSC address pattern
    pub osc_address: String,
    /// OSC arguments
    pub args: Vec<OscArg>,
    /// Target name, for logging
    pub target_name: String,
    /// Target host
    pub host: String,
    /// Target UDP port
    pub port: u16,
}

impl DispatchInstruction {
    /// Build an instruction straight from a command and a target
    pub fn from_parts(mapping_id: Option<u64>, command: &Command, target: &Target) -> Self {
        Self {
            mapping_id,
            command_name: command.name.clone(),
            osc_address: command.address.clone(),
            args: command.args.clone(),
            target_name: target.name.clone(),
            host: target.host.clone(),
            port: target.port,
        }
    }

    /// Pool key of the target
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolves buzzer presses to dispatch instructions
#[derive(Clone)]
pub struct MappingResolver {
    source: Arc<dyn ConfigSource>,
}

impl MappingResolver {
    /// Create a resolver over a configuration source
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    /// Active routes for a device, in mapping storage order
    ///
    /// An empty list is a valid answer.
    pub async fn resolve(&self, device_id: &str) -> Result<Vec<DispatchInstruction>> {
        let bindings = self.source.bindings().await?;
        let binding_ids: Vec<u64> = bindings
            .iter()
            .filter(|b| b.active && b.device_id == device_id)
            .map(|b| b.id)
            .collect();

        if binding_ids.is_empty() {
            debug!(device_id, "No active binding for device");
            return Ok(Vec::new());
        }

        let mappings = self.source.mappings().await?;
        let commands: HashMap<u64, Command> = self
            .source
            .commands()
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        let targets: HashMap<u64, Target> = self
            .source
            .targets()
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let mut instructions = Vec::new();
        for mapping in mappings
            .iter()
            .filter(|m| m.active && binding_ids.contains(&m.binding_id))
        {
            let Some(command) = commands.get(&mapping.command_id) else {
                warn!(
                    mapping_id = mapping.id,
                    command_id = mapping.command_id,
                    "Mapping references a missing command"
                );
                continue;
            };
            let Some(target) = targets.get(&mapping.target_id) else {
                warn!(
                    mapping_id = mapping.id,
                    target_id = mapping.target_id,
                    "Mapping references a missing target"
                );
                continue;
            };
            if !target.active {
                continue;
            }
            instructions.push(DispatchInstruction::from_parts(
                Some(mapping.id),
                command,
                target,
            ));
        }

        debug!(device_id, routes = instructions.len(), "Resolved routes");
        Ok(instructions)
    }
}

impl std::fmt::Debug for MappingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingResolver").finish_non_exhaustive()
    }
}
