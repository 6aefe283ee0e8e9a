//! Interactive operator console on stdin

use std::fmt::Write as _;
use std::str::FromStr;

use buzzer_bridge::{BridgeHandle, CoordinatorCommand, MemoryConfigSource};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Commands typed by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Forward a command to the coordinator
    Coordinator(CoordinatorCommand),
    /// Simulate a press
    Press { device_id: String },
    /// Send one command to one target by name
    Test { command: String, target: String },
    /// Print known devices
    Devices,
    /// Print bridge statistics
    Stats,
    /// Print the command list
    Help,
    /// Stop the bridge
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let rest: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("status", []) => Self::Coordinator(CoordinatorCommand::Status),
            ("scan", []) => Self::Coordinator(CoordinatorCommand::Scan),
            ("disarm", []) => Self::Coordinator(CoordinatorCommand::Disarm),
            ("arm", []) => Self::Coordinator(CoordinatorCommand::Arm(None)),
            ("arm", [suffix]) => Self::Coordinator(CoordinatorCommand::Arm(Some(suffix.to_string()))),
            ("press", [device_id]) => Self::Press {
                device_id: device_id.to_string(),
            },
            ("test", [command, target]) => Self::Test {
                command: command.to_string(),
                target: target.to_string(),
            },
            ("devices", []) => Self::Devices,
            ("stats", []) => Self::Stats,
            ("help" | "?", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            _ => return Err(format!("unknown command: {}", line.trim())),
        };
        Ok(command)
    }
}

const HELP: &str = "\
commands:
  status | scan | disarm | arm [suffix]   send to coordinator
  press <device-id>                       simulate a buzzer press
  test <command> <target>                 send one OSC command by name
  devices                                 list known buzzers
  stats                                   bridge counters
  quit                                    stop the bridge";

/// Read commands from stdin until `quit` or end of input
pub async fn run(handle: BridgeHandle, routes: MemoryConfigSource) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Console ready; type 'help' for commands");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Console read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{} (type 'help')", e);
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            break;
        }
        match execute(command, &handle, &routes).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {}", e),
        }
    }

    info!("Console closed, shutting down");
    let _ = handle.shutdown().await;
}

async fn execute(
    command: ConsoleCommand,
    handle: &BridgeHandle,
    routes: &MemoryConfigSource,
) -> anyhow::Result<String> {
    let output = match command {
        ConsoleCommand::Coordinator(cmd) => {
            handle.send_command(cmd.clone()).await?;
            format!("sent {}", cmd)
        }
        ConsoleCommand::Press { device_id } => {
            let task = handle.inject_press(device_id.as_str()).await?;
            let outcomes = task.await?;
            let mut out = format!("press {}: {} outcome(s)", device_id, outcomes.len());
            for outcome in outcomes {
                let _ = write!(out, "\n  {:?}: {}", outcome.kind, outcome.message);
            }
            out
        }
        ConsoleCommand::Test { command, target } => {
            let snapshot = routes.snapshot();
            let command = snapshot
                .commands
                .into_iter()
                .find(|c| c.name == command)
                .ok_or_else(|| anyhow::anyhow!("no command named '{}'", command))?;
            let target = snapshot
                .targets
                .into_iter()
                .find(|t| t.name == target)
                .ok_or_else(|| anyhow::anyhow!("no target named '{}'", target))?;
            let outcome = handle.test_dispatch(command, target).await?;
            format!("{:?}: {}", outcome.kind, outcome.message)
        }
        ConsoleCommand::Devices => {
            let devices = handle.devices().await?;
            if devices.is_empty() {
                "no devices seen yet".to_string()
            } else {
                let mut out = String::new();
                for d in devices {
                    let _ = writeln!(
                        out,
                        "{:<20} {:<8} armed={:<5} presses={:<4} last_seen={}",
                        d.device_id,
                        if d.online { "online" } else if d.stale { "stale" } else { "offline" },
                        d.armed,
                        d.press_count,
                        d.last_seen_at.format("%H:%M:%S"),
                    );
                }
                out.trim_end().to_string()
            }
        }
        ConsoleCommand::Stats => serde_json::to_string_pretty(&handle.stats().await?)?,
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coordinator_commands() {
        assert_eq!(
            "SCAN".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Coordinator(CoordinatorCommand::Scan)
        );
        assert_eq!(
            "arm 2".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Coordinator(CoordinatorCommand::Arm(Some("2".to_string())))
        );
    }

    #[test]
    fn test_parse_press_and_test() {
        assert_eq!(
            "press AA:BB:CC:DD:EE:FF".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Press {
                device_id: "AA:BB:CC:DD:EE:FF".to_string()
            }
        );
        assert_eq!(
            "test go qlab".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Test {
                command: "go".to_string(),
                target: "qlab".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_arity() {
        assert!("press".parse::<ConsoleCommand>().is_err());
        assert!("status now".parse::<ConsoleCommand>().is_err());
        assert!("reboot".parse::<ConsoleCommand>().is_err());
    }
}
