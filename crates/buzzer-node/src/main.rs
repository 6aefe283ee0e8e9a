//! Buzzer Node - serial buzzer coordinator to OSC bridge
//!
//! This binary runs the bridge with:
//! - the coordinator on a serial port, or simulation mode without hardware
//! - routing (bindings, commands, targets, mappings) loaded from a JSON file
//! - a JSON-lines activity log
//! - an interactive console on stdin

mod console;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use buzzer_bridge::{
    find_coordinator_port, ActivityEvent, ActivityLog, BridgeConfig, BuzzerBridge,
    InterfaceConfig, JsonLinesLog, MemoryConfigSource, NullActivityLog, Transport,
    DEFAULT_BAUD_RATE,
};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "buzzer-node")]
#[command(about = "Bridge wireless buzzer presses from a serial coordinator to OSC over UDP")]
struct Args {
    /// Serial port of the coordinator, or "auto" to detect it
    #[arg(long, short)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Run without hardware even if a port is configured
    #[arg(long)]
    simulate: bool,

    /// Bridge configuration file (JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Routing configuration file (JSON)
    #[arg(long, short)]
    routes: Option<PathBuf>,

    /// Activity log file (JSON lines)
    #[arg(long, default_value = "activity.jsonl")]
    activity_log: PathBuf,

    /// Do not write an activity log
    #[arg(long)]
    no_activity_log: bool,

    /// Report devices offline after this much silence (e.g. "60s")
    #[arg(long, value_parser = humantime::parse_duration)]
    stale_after: Option<Duration>,

    /// Print live events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Buzzer Node v{}", buzzer_bridge::VERSION);

    let config = build_config(&args)?;

    let routes = match &args.routes {
        Some(path) => MemoryConfigSource::from_json_file(path)?,
        None => {
            warn!("No routing file given; every press will be unmapped");
            MemoryConfigSource::default()
        }
    };

    let log: Arc<dyn ActivityLog> = if args.no_activity_log {
        Arc::new(NullActivityLog)
    } else {
        info!(path = %args.activity_log.display(), "Recording activity");
        Arc::new(JsonLinesLog::new(&args.activity_log))
    };

    let transport = Transport::open(&config).await;
    let (bridge, handle) = BuzzerBridge::new(transport, &config, Arc::new(routes.clone()), log);

    // Spawn live event printer
    let events = handle.subscribe();
    let json = args.json;
    tokio::spawn(async move {
        print_events(events, json).await;
    });

    let mut bridge_task = tokio::spawn(bridge.run());

    if !args.no_console {
        tokio::spawn(console::run(handle.clone(), routes));
    }

    tokio::select! {
        result = &mut bridge_task => {
            match result {
                Ok(Ok(())) => info!("Bridge stopped"),
                Ok(Err(e)) => error!(error = %e, "Bridge failed"),
                Err(e) => error!(error = %e, "Bridge task panicked"),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            let _ = handle.shutdown().await;
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), bridge_task).await {
        Ok(Ok(Ok(()))) => info!("Bridge stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "Bridge failed during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Bridge task panicked"),
        Err(_) => warn!("Bridge did not stop in time"),
    }
    Ok(())
}

/// Merge the config file with command line overrides
fn build_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let config = BridgeConfig::from_json_file(path)?;
            info!(path = %path.display(), "Loaded bridge configuration");
            config
        }
        None => BridgeConfig::default(),
    };

    if args.simulate {
        config.interface = InterfaceConfig::Simulated;
    } else if let Some(port) = &args.port {
        let port = if port.eq_ignore_ascii_case("auto") {
            find_coordinator_port()
        } else {
            Some(port.clone())
        };
        config.interface = match port {
            Some(port) => InterfaceConfig::Serial {
                port: PathBuf::from(port),
                baud_rate: args.baud,
            },
            None => {
                warn!("No coordinator detected");
                InterfaceConfig::Simulated
            }
        };
    }

    if let Some(stale_after) = args.stale_after {
        config.devices.stale_after = stale_after;
    }

    config.validate()?;
    Ok(config)
}

async fn print_events(mut events: broadcast::Receiver<ActivityEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &ActivityEvent) {
    match event {
        ActivityEvent::Press { press, device, .. } => {
            info!(device_id = %press.device_id, presses = device.press_count, "PRESS");
        }
        ActivityEvent::DeviceUpdated { device, .. } => {
            info!(
                device_id = %device.device_id,
                online = device.online,
                armed = device.armed,
                "DEVICE"
            );
        }
        ActivityEvent::Status { report, .. } => {
            info!(fields = ?report.fields, "STATUS");
        }
        ActivityEvent::Heartbeat { slot, .. } => {
            info!(slot, "HEARTBEAT");
        }
        ActivityEvent::CoordinatorAck { text, .. } => {
            info!(ack = %text, "ACK");
        }
        ActivityEvent::CoordinatorError { text, .. } => {
            warn!(error = %text, "COORDINATOR ERROR");
        }
        ActivityEvent::TransportMode { mode, .. } => {
            info!(mode = %mode, "LINK");
        }
        ActivityEvent::Dispatch { outcome } => {
            if outcome.success {
                info!(
                    address = outcome.osc_address.as_deref().unwrap_or("-"),
                    target = outcome.target_address.as_deref().unwrap_or("-"),
                    test = outcome.test,
                    "OSC SENT"
                );
            } else {
                warn!(kind = ?outcome.kind, message = %outcome.message, "OSC NOT SENT");
            }
        }
    }
}
