//! Activity and live event fan-out
//!
//! Every observable thing the bridge does becomes an [`ActivityEvent`]. The
//! [`ActivitySink`] hands each event to two independent consumers:
//!
//! - live observers, over a `tokio::sync::broadcast` channel
//! - the durable [`ActivityLog`], through a background writer task that
//!   appends in publish order
//!
//! Publishing never blocks and never fails from the caller's point of view.
//! A log failure is logged and dropped; a missing observer is fine. The log
//! queue is bounded: when a slow log lets it fill up, new entries are
//! dropped and counted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_LOG_QUEUE_SIZE;
use crate::devices::DeviceView;
use crate::dispatch::DispatchOutcome;
use crate::error::{BridgeError, Result};
use crate::interface::TransportMode;
use crate::protocol::{PressEvent, StatusReport};

/// Something worth recording or showing live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    /// A buzzer was pressed
    Press {
        /// The press
        press: PressEvent,
        /// Device state after the press
        device: DeviceView,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// A device's presence changed
    DeviceUpdated {
        /// Device state after the update
        device: DeviceView,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// Coordinator status report
    Status {
        /// Decoded report
        report: StatusReport,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// Slot heartbeat
    Heartbeat {
        /// Coordinator slot
        slot: u32,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// Coordinator acknowledged a command
    CoordinatorAck {
        /// Acknowledgement text
        text: String,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// Coordinator reported an error
    CoordinatorError {
        /// Error text
        text: String,
        /// When the bridge handled it
        at: DateTime<Utc>,
    },
    /// The link switched between serial and simulation
    TransportMode {
        /// New mode
        mode: TransportMode,
        /// When the switch happened
        at: DateTime<Utc>,
    },
    /// Result of one OSC dispatch attempt
    Dispatch {
        /// The outcome
        outcome: DispatchOutcome,
    },
}

impl ActivityEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityEvent::Press { .. } => "press",
            ActivityEvent::DeviceUpdated { .. } => "device_updated",
            ActivityEvent::Status { .. } => "status",
            ActivityEvent::Heartbeat { .. } => "heartbeat",
            ActivityEvent::CoordinatorAck { .. } => "coordinator_ack",
            ActivityEvent::CoordinatorError { .. } => "coordinator_error",
            ActivityEvent::TransportMode { .. } => "transport_mode",
            ActivityEvent::Dispatch { .. } => "dispatch",
        }
    }
}

/// Append-only durable activity record
#[async_trait]
pub trait ActivityLog: Send + Sync {
    /// Append one event
    async fn append(&self, event: &ActivityEvent) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullActivityLog;

#[async_trait]
impl ActivityLog for NullActivityLog {
    async fn append(&self, _event: &ActivityEvent) -> Result<()> {
        Ok(())
    }
}

/// Keeps events in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryActivityLog {
    events: Arc<Mutex<Vec<ActivityEvent>>>,
}

impl MemoryActivityLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().clone()
    }

    /// Dispatch outcomes appended so far
    pub fn outcomes(&self) -> Vec<DispatchOutcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ActivityEvent::Dispatch { outcome } => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of appended events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was appended
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn append(&self, event: &ActivityEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonLinesLog {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesLog {
    /// Log to `path`; the file is created on first append
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ActivityLog for JsonLinesLog {
    async fn append(&self, event: &ActivityEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    BridgeError::ActivityLog(format!("open {}: {}", self.path.display(), e))
                })?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            let written = async {
                file.write_all(&line).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                // Reopen on the next append
                *guard = None;
                return Err(BridgeError::ActivityLog(e.to_string()));
            }
        }
        Ok(())
    }
}

enum SinkMessage {
    Append(ActivityEvent),
    Flush(oneshot::Sender<()>),
}

/// Fan-out point for activity events
#[derive(Clone)]
pub struct ActivitySink {
    live: broadcast::Sender<ActivityEvent>,
    log_tx: mpsc::Sender<SinkMessage>,
    dropped: Arc<AtomicU64>,
}

impl ActivitySink {
    /// Create a sink and spawn its log writer
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(log: Arc<dyn ActivityLog>, buffer: usize) -> Self {
        Self::with_log_capacity(log, buffer, DEFAULT_LOG_QUEUE_SIZE)
    }

    /// Create a sink whose log queue holds at most `capacity` entries
    pub fn with_log_capacity(log: Arc<dyn ActivityLog>, buffer: usize, capacity: usize) -> Self {
        let (live, _) = broadcast::channel(buffer.max(1));
        let (log_tx, log_rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_log_writer(log, log_rx));
        Self {
            live,
            log_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to observers and queue for the durable log
    pub fn publish(&self, event: ActivityEvent) {
        let kind = event.kind();
        match self.live.send(event.clone()) {
            Ok(observers) => trace!(kind, observers, "Published live event"),
            Err(_) => trace!(kind, "No live observers"),
        }
        match self.log_tx.try_send(SinkMessage::Append(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(kind, dropped, "Activity log queue full; event not recorded");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(kind, "Activity log writer has stopped; event not recorded");
            }
        }
    }

    /// Events dropped because the log queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe to live events
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.live.subscribe()
    }

    /// Wait until everything published so far has reached the log
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.log_tx.send(SinkMessage::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for ActivitySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivitySink")
            .field("observers", &self.live.receiver_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

async fn run_log_writer(log: Arc<dyn ActivityLog>, mut rx: mpsc::Receiver<SinkMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            SinkMessage::Append(event) => {
                if let Err(e) = log.append(&event).await {
                    warn!(kind = event.kind(), error = %e, code = e.error_code(), "Failed to record activity");
                }
            }
            SinkMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Activity log writer stopped");
}
