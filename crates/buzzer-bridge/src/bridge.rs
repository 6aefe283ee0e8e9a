//! BuzzerBridge - the event loop
//!
//! One task owns the coordinator link and the device registry and serializes
//! everything that touches them:
//!
//! - lines read from the coordinator (physical or simulated)
//! - administrative requests arriving through a [`BridgeHandle`]
//! - a periodic maintenance tick (serial reconnect attempts)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          BuzzerBridge                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────────┐   │
//! │  │ Coordinator │──►│ parse_line   │──►│ DeviceRegistry       │   │
//! │  │ (Transport) │◄──│ Bridge Core  │   └──────────────────────┘   │
//! │  └─────────────┘   │              │   ┌──────────────────────┐   │
//! │                    │              │──►│ Dispatcher (spawned) │──►UDP
//! │  ┌─────────────┐   │              │   └──────────────────────┘   │
//! │  │BridgeHandle │──►│              │   ┌──────────────────────┐   │
//! │  └─────────────┘   └──────────────┘──►│ ActivitySink         │   │
//! │                                       └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Registry updates for a line are applied before the next line is read, so
//! per-device ordering follows arrival order. Press fan-out runs on spawned
//! tasks and is never awaited by the loop.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = BridgeConfigBuilder::new().simulated().build();
//! let transport = Transport::open(&config).await;
//! let (bridge, handle) = BuzzerBridge::new(transport, &config, source, log);
//! tokio::spawn(bridge.run());
//!
//! handle.send_command(CoordinatorCommand::Scan).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::activity::{ActivityEvent, ActivityLog, ActivitySink};
use crate::config::BridgeConfig;
use crate::devices::{DeviceRegistry, DeviceView};
use crate::dispatch::{DispatchOutcome, Dispatcher, SenderPool};
use crate::error::{BridgeError, Result};
use crate::interface::{CoordinatorInterface, TransportMode};
use crate::protocol::{parse_line, CoordinatorCommand, LineEvent, PressEvent};
use crate::resolver::MappingResolver;
use crate::store::{Command, ConfigSource, Target};

/// Shortest maintenance tick the loop accepts
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to the background dispatch of one press
pub type PressTask = JoinHandle<Vec<DispatchOutcome>>;

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Write a command to the coordinator
    SendCommand {
        /// Command to write
        command: CoordinatorCommand,
        /// Write result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Treat a device as pressed without the coordinator
    InjectPress {
        /// Hardware address
        device_id: String,
        /// Dispatch task for the press
        reply: oneshot::Sender<PressTask>,
    },
    /// Send one command to one target, bypassing mappings
    TestDispatch {
        /// Command to send
        command: Command,
        /// Where to send it
        target: Target,
        /// Outcome of the send
        reply: oneshot::Sender<DispatchOutcome>,
    },
    /// Snapshot of every known device
    Devices(oneshot::Sender<Vec<DeviceView>>),
    /// One device, if known
    Device(String, oneshot::Sender<Option<DeviceView>>),
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Lines read from the coordinator
    pub lines_received: u64,
    /// Presses handled (including injected ones)
    pub presses: u64,
    /// Presence updates applied
    pub presence_updates: u64,
    /// Status reports received
    pub status_reports: u64,
    /// Slot heartbeats received
    pub heartbeats: u64,
    /// Acknowledgements received
    pub acks: u64,
    /// Errors reported by the coordinator
    pub coordinator_errors: u64,
    /// Lines that matched no known shape
    pub unrecognized_lines: u64,
    /// Interface errors (serial, etc.)
    pub interface_errors: u64,
    /// Commands written to the coordinator
    pub commands_sent: u64,
    /// Link in use
    pub transport_mode: Option<TransportMode>,
    /// Most recent slot heartbeat
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Handle for controlling the BuzzerBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    sink: ActivitySink,
}

impl BridgeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Write a command to the coordinator
    pub async fn send_command(&self, command: CoordinatorCommand) -> Result<()> {
        self.request(|reply| BridgeCommand::SendCommand { command, reply })
            .await?
    }

    /// Inject a press for `device_id`
    ///
    /// Returns once the registry is updated; the returned task settles when
    /// every dispatch attempt for the press has finished.
    pub async fn inject_press(&self, device_id: impl Into<String>) -> Result<PressTask> {
        let device_id = device_id.into();
        self.request(|reply| BridgeCommand::InjectPress { device_id, reply })
            .await
    }

    /// Send a command to a target directly and report the outcome
    pub async fn test_dispatch(&self, command: Command, target: Target) -> Result<DispatchOutcome> {
        self.request(|reply| BridgeCommand::TestDispatch {
            command,
            target,
            reply,
        })
        .await
    }

    /// Every known device, ordered by identifier
    pub async fn devices(&self) -> Result<Vec<DeviceView>> {
        self.request(BridgeCommand::Devices).await
    }

    /// One device, or `None` if it was never observed
    pub async fn device(&self, device_id: impl Into<String>) -> Result<Option<DeviceView>> {
        let device_id = device_id.into();
        self.request(|reply| BridgeCommand::Device(device_id, reply))
            .await
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        self.request(BridgeCommand::GetStats).await
    }

    /// Live activity events
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.sink.subscribe()
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

/// Main bridge service connecting buzzer presses to OSC targets
pub struct BuzzerBridge<I: CoordinatorInterface> {
    /// Coordinator link
    interface: I,
    /// Device presence
    registry: DeviceRegistry,
    /// Press fan-out
    dispatcher: Dispatcher,
    /// Activity fan-out
    sink: ActivitySink,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Bridge statistics
    stats: BridgeStats,
    /// Period of the maintenance tick
    maintenance_interval: Duration,
    /// Backoff after an interface error the link did not absorb
    error_backoff: Duration,
    /// Last link mode announced to observers
    announced_mode: Option<TransportMode>,
    /// Running flag
    running: bool,
}

impl<I: CoordinatorInterface + 'static> BuzzerBridge<I> {
    /// Create a new bridge
    ///
    /// Must be called inside a tokio runtime: the activity log writer is
    /// spawned here.
    pub fn new(
        interface: I,
        config: &BridgeConfig,
        source: Arc<dyn ConfigSource>,
        log: Arc<dyn ActivityLog>,
    ) -> (Self, BridgeHandle) {
        let sink = ActivitySink::with_log_capacity(
            log,
            config.runtime.event_buffer,
            config.runtime.log_queue_size,
        );
        let dispatcher = Dispatcher::new(
            MappingResolver::new(source),
            Arc::new(SenderPool::new()),
            sink.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(config.runtime.command_queue_size.max(1));
        let handle = BridgeHandle {
            command_tx,
            sink: sink.clone(),
        };

        let bridge = Self {
            interface,
            registry: DeviceRegistry::from_config(&config.devices),
            dispatcher,
            sink,
            command_rx,
            stats: BridgeStats::default(),
            maintenance_interval: config.runtime.maintenance_interval.max(MIN_MAINTENANCE_INTERVAL),
            error_backoff: config.reconnect.initial_delay,
            announced_mode: None,
            running: false,
        };

        (bridge, handle)
    }

    /// Run the bridge service until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!(link = self.interface.name(), "Starting buzzer bridge");

        self.interface.connect().await?;
        self.running = true;
        self.announce_mode();

        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running {
            tokio::select! {
                line_result = self.interface.read_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            self.handle_line(&line, Utc::now());
                        }
                        Ok(None) => {
                            trace!("No complete line available");
                        }
                        Err(e) => {
                            self.stats.interface_errors += 1;
                            self.recover_interface(e).await;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                _ = maintenance.tick() => {
                    if let Err(e) = self.interface.maintain().await {
                        debug!(error = %e, "Interface maintenance failed");
                    }
                }
            }

            self.announce_mode();
        }

        info!("Buzzer bridge stopping");
        if let Err(e) = self.interface.disconnect().await {
            warn!(error = %e, "Error disconnecting coordinator link");
        }
        self.dispatcher.close();
        self.sink.flush().await;

        info!(
            lines = self.stats.lines_received,
            presses = self.stats.presses,
            "Buzzer bridge stopped"
        );
        Ok(())
    }

    /// Apply one coordinator line
    ///
    /// Returns the dispatch task when the line was a press.
    pub fn handle_line(&mut self, line: &str, now: DateTime<Utc>) -> Option<PressTask> {
        self.stats.lines_received += 1;

        match parse_line(line) {
            LineEvent::Press(press) => return Some(self.handle_press(press, now)),
            LineEvent::Presence {
                device_id,
                update,
                mode,
                ignored,
            } => {
                if !ignored.is_empty() {
                    debug!(device_id = %device_id, ?ignored, "Ignored presence fields");
                }
                let device = self.registry.record_presence(&device_id, &update, mode, now);
                self.stats.presence_updates += 1;
                self.sink
                    .publish(ActivityEvent::DeviceUpdated { device, at: now });
            }
            LineEvent::Status { report, ignored } => {
                if !ignored.is_empty() {
                    debug!(?ignored, "Ignored status fields");
                }
                self.stats.status_reports += 1;
                self.sink.publish(ActivityEvent::Status { report, at: now });
            }
            LineEvent::Heartbeat { slot } => {
                let mark = self.registry.record_heartbeat(slot, now);
                self.stats.heartbeats += 1;
                self.stats.last_heartbeat_at = Some(mark.at);
                self.sink.publish(ActivityEvent::Heartbeat { slot, at: now });
            }
            LineEvent::Ack(text) => {
                debug!(ack = %text, "Coordinator acknowledged");
                self.stats.acks += 1;
                self.sink
                    .publish(ActivityEvent::CoordinatorAck { text, at: now });
            }
            LineEvent::DeviceError(text) => {
                warn!(error = %text, "Coordinator reported an error");
                self.stats.coordinator_errors += 1;
                self.sink
                    .publish(ActivityEvent::CoordinatorError { text, at: now });
            }
            LineEvent::Unrecognized(text) => {
                debug!(line = %text, "Unrecognized coordinator line");
                self.stats.unrecognized_lines += 1;
            }
        }
        None
    }

    fn handle_press(&mut self, press: PressEvent, now: DateTime<Utc>) -> PressTask {
        let device = self
            .registry
            .record_press(&press.device_id, press.timestamp_ms, now);
        self.stats.presses += 1;
        info!(
            device_id = %press.device_id,
            source = ?press.source,
            count = device.press_count,
            "Buzzer pressed"
        );

        self.sink.publish(ActivityEvent::Press {
            press: press.clone(),
            device,
            at: now,
        });
        self.dispatcher.spawn_press(press)
    }

    async fn handle_command(&mut self, cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::SendCommand { command, reply } => {
                let result = self.send_command(&command).await;
                let _ = reply.send(result);
            }
            BridgeCommand::InjectPress { device_id, reply } => {
                let task = self.handle_press(PressEvent::injected(device_id), Utc::now());
                let _ = reply.send(task);
            }
            BridgeCommand::TestDispatch {
                command,
                target,
                reply,
            } => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher.send_test(&command, &target).await;
                    let _ = reply.send(outcome);
                });
            }
            BridgeCommand::Devices(reply) => {
                let _ = reply.send(self.registry.snapshot(Utc::now()));
            }
            BridgeCommand::Device(device_id, reply) => {
                let _ = reply.send(self.registry.view(&device_id, Utc::now()));
            }
            BridgeCommand::GetStats(reply) => {
                let mut stats = self.stats.clone();
                stats.transport_mode = Some(self.interface.mode());
                let _ = reply.send(stats);
            }
            BridgeCommand::Shutdown => {
                info!("Bridge shutdown requested");
                self.running = false;
            }
        }
    }

    async fn send_command(&mut self, command: &CoordinatorCommand) -> Result<()> {
        let text = command.to_string();
        debug!(command = %text, link = self.interface.name(), "Sending coordinator command");
        match self.interface.write_line(&text).await {
            Ok(()) => {
                self.stats.commands_sent += 1;
                Ok(())
            }
            Err(e) => {
                warn!(command = %text, error = %e, "Failed to send coordinator command");
                self.stats.interface_errors += 1;
                Err(e)
            }
        }
    }

    /// Handle a read error the link could not absorb itself
    async fn recover_interface(&mut self, e: BridgeError) {
        warn!(link = self.interface.name(), error = %e, code = e.error_code(), "Error reading from coordinator");

        if e.is_retriable() && !self.interface.is_connected() {
            let _ = self.interface.disconnect().await;
            tokio::time::sleep(self.error_backoff).await;
            match self.interface.connect().await {
                Ok(()) => info!(link = self.interface.name(), "Reconnected to coordinator"),
                Err(reconnect_err) => error!(error = %reconnect_err, "Failed to reconnect"),
            }
        } else {
            tokio::time::sleep(self.error_backoff).await;
        }
    }

    fn announce_mode(&mut self) {
        let mode = self.interface.mode();
        if self.announced_mode != Some(mode) {
            info!(mode = %mode, link = self.interface.name(), "Coordinator link mode");
            self.announced_mode = Some(mode);
            self.stats.transport_mode = Some(mode);
            self.sink.publish(ActivityEvent::TransportMode {
                mode,
                at: Utc::now(),
            });
        }
    }

    /// Device registry (read-only)
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current statistics
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// The dispatcher used for presses
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
