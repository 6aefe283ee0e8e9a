//! OSC dispatch engine
//!
//! ```text
//! press ──► MappingResolver ──► 0 routes ──► Unmapped
//!                          └──► N routes ──► N × (SenderPool ──► UDP) ──► Sent | SendFailed
//! ```
//!
//! Every attempt produces exactly one [`DispatchOutcome`], which is handed to
//! the [`ActivitySink`]. Attempts for one press are independent: a failing
//! target does not stop or alter its siblings.
//!
//! UDP offers no acknowledgement. `Sent` means the local socket accepted the
//! datagram and nothing more.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityEvent, ActivitySink};
use crate::error::{BridgeError, Result};
use crate::osc;
use crate::protocol::PressEvent;
use crate::resolver::{DispatchInstruction, MappingResolver};
use crate::store::{Command, Target};

/// Terminal state of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Datagram accepted by the local socket
    Sent,
    /// Encoding, resolution or local send failed
    SendFailed,
    /// The press had no active route
    Unmapped,
    /// The routing configuration could not be read
    ResolveFailed,
}

/// Immutable record of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Unique id
    pub id: Uuid,
    /// Terminal state
    pub kind: OutcomeKind,
    /// Buzzer that triggered the attempt (`None` for test sends)
    pub device_id: Option<String>,
    /// Mapping that produced the attempt
    pub mapping_id: Option<u64>,
    /// Command name
    pub command_name: Option<String>,
    /// OSC address pattern
    pub osc_address: Option<String>,
    /// Target name
    pub target_name: Option<String>,
    /// Target `host:port`
    pub target_address: Option<String>,
    /// Whether the attempt succeeded locally
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// Administrator-triggered verification send
    pub test: bool,
}

impl DispatchOutcome {
    fn for_instruction(
        kind: OutcomeKind,
        instruction: &DispatchInstruction,
        device_id: Option<&str>,
        message: String,
        test: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            device_id: device_id.map(str::to_string),
            mapping_id: instruction.mapping_id,
            command_name: Some(instruction.command_name.clone()),
            osc_address: Some(instruction.osc_address.clone()),
            target_name: Some(instruction.target_name.clone()),
            target_address: Some(instruction.target_address()),
            success: kind == OutcomeKind::Sent,
            message,
            timestamp: Utc::now(),
            test,
        }
    }

    fn for_press(kind: OutcomeKind, device_id: &str, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            device_id: Some(device_id.to_string()),
            mapping_id: None,
            command_name: None,
            osc_address: None,
            target_name: None,
            target_address: None,
            success: false,
            message,
            timestamp: Utc::now(),
            test: false,
        }
    }
}

/// A UDP socket bound for one `host:port` target
#[derive(Debug)]
pub struct OscSender {
    key: String,
    remote: SocketAddr,
    socket: UdpSocket,
    sent: AtomicU64,
}

impl OscSender {
    fn bind(key: String, remote: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let std_socket = std::net::UdpSocket::bind(local)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            key,
            remote,
            socket,
            sent: AtomicU64::new(0),
        })
    }

    /// Pool key (`host:port`)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolved remote address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Datagrams accepted so far
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Send one encoded message
    pub async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket
            .send_to(datagram, self.remote)
            .await
            .map_err(|e| BridgeError::SendFailed {
                target: self.key.clone(),
                reason: e.to_string(),
            })?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Lazily-created UDP senders keyed by `host:port`
///
/// Two targets with different names but the same host and port share one
/// sender.
#[derive(Debug, Default)]
pub struct SenderPool {
    senders: Mutex<HashMap<String, Arc<OscSender>>>,
    created: AtomicU64,
    closed: AtomicBool,
}

impl SenderPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the sender for a target
    pub async fn sender(&self, host: &str, port: u16) -> Result<Arc<OscSender>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::PoolClosed);
        }

        let key = format!("{}:{}", host, port);
        let existing = self.senders.lock().get(&key).cloned();
        if let Some(sender) = existing {
            return Ok(sender);
        }

        let remote = resolve_target(host, port, &key).await?;

        let mut senders = self.senders.lock();
        if let Some(sender) = senders.get(&key) {
            return Ok(sender.clone());
        }
        let sender = Arc::new(OscSender::bind(key.clone(), remote)?);
        self.created.fetch_add(1, Ordering::Relaxed);
        senders.insert(key.clone(), sender.clone());
        debug!(target = %key, remote = %remote, "Created OSC sender");

        Ok(sender)
    }

    /// Number of senders ever created
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of live senders
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    /// Whether the pool holds no senders
    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }

    /// Release every sender and refuse new ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let released = {
            let mut senders = self.senders.lock();
            let count = senders.len();
            senders.clear();
            count
        };
        info!(released, "Closed OSC sender pool");
    }
}

async fn resolve_target(host: &str, port: u16, key: &str) -> Result<SocketAddr> {
    let resolve_error = |reason: String| BridgeError::ResolveFailed {
        target: key.to_string(),
        reason,
    };
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| resolve_error(e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| resolve_error("no addresses".to_string()))
}

/// Resolves presses and sends the resulting OSC messages
#[derive(Debug, Clone)]
pub struct Dispatcher {
    resolver: MappingResolver,
    pool: Arc<SenderPool>,
    sink: ActivitySink,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(resolver: MappingResolver, pool: Arc<SenderPool>, sink: ActivitySink) -> Self {
        Self {
            resolver,
            pool,
            sink,
        }
    }

    /// The sender pool
    pub fn pool(&self) -> &Arc<SenderPool> {
        &self.pool
    }

    /// Handle a press in the background
    ///
    /// The caller is not expected to await the handle; it exists so tests and
    /// shutdown code can observe settlement.
    pub fn spawn_press(&self, press: PressEvent) -> JoinHandle<Vec<DispatchOutcome>> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_press(&press).await })
    }

    /// Resolve a press and send to every route
    pub async fn dispatch_press(&self, press: &PressEvent) -> Vec<DispatchOutcome> {
        let device_id = press.device_id.as_str();

        let instructions = match self.resolver.resolve(device_id).await {
            Ok(instructions) => instructions,
            Err(e) => {
                warn!(device_id, error = %e, "Could not resolve routes for press");
                let outcome = DispatchOutcome::for_press(
                    OutcomeKind::ResolveFailed,
                    device_id,
                    format!("Route lookup failed: {}", e),
                );
                self.report(&outcome);
                return vec![outcome];
            }
        };

        if instructions.is_empty() {
            info!(device_id, "Unmapped press");
            let outcome = DispatchOutcome::for_press(
                OutcomeKind::Unmapped,
                device_id,
                format!("No active mapping for {}", device_id),
            );
            self.report(&outcome);
            return vec![outcome];
        }

        let attempts = instructions
            .iter()
            .map(|instruction| self.send_instruction(instruction, Some(device_id), false));
        join_all(attempts).await
    }

    /// Send a command to a target directly, bypassing mapping resolution
    pub async fn send_test(&self, command: &Command, target: &Target) -> DispatchOutcome {
        let instruction = DispatchInstruction::from_parts(None, command, target);
        self.send_instruction(&instruction, None, true).await
    }

    /// Render, send and report one instruction
    pub async fn send_instruction(
        &self,
        instruction: &DispatchInstruction,
        device_id: Option<&str>,
        test: bool,
    ) -> DispatchOutcome {
        let result = async {
            let datagram = osc::encode_message(&instruction.osc_address, &instruction.args)?;
            let sender = self.pool.sender(&instruction.host, instruction.port).await?;
            sender.send(&datagram).await
        }
        .await;

        let outcome = match result {
            Ok(()) => {
                debug!(
                    address = %instruction.osc_address,
                    target = %instruction.target_address(),
                    test,
                    "OSC message sent"
                );
                DispatchOutcome::for_instruction(
                    OutcomeKind::Sent,
                    instruction,
                    device_id,
                    format!(
                        "Sent {} to {} ({})",
                        instruction.osc_address,
                        instruction.target_name,
                        instruction.target_address()
                    ),
                    test,
                )
            }
            Err(e) => {
                warn!(
                    address = %instruction.osc_address,
                    target = %instruction.target_address(),
                    error = %e,
                    code = e.error_code(),
                    "OSC send failed"
                );
                DispatchOutcome::for_instruction(
                    OutcomeKind::SendFailed,
                    instruction,
                    device_id,
                    e.to_string(),
                    test,
                )
            }
        };

        self.report(&outcome);
        outcome
    }

    /// Release pooled senders; in-flight sends are abandoned
    pub fn close(&self) {
        self.pool.close();
    }

    fn report(&self, outcome: &DispatchOutcome) {
        self.sink.publish(ActivityEvent::Dispatch {
            outcome: outcome.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::MemoryActivityLog;
    use crate::osc::OscArg;
    use crate::store::MemoryConfigSource;

    fn target(name: &str, host: &str, port: u16) -> Target {
        Target {
            id: 1,
            name: name.to_string(),
            host: host.to_string(),
            port,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_pool_keys_on_address_not_name() {
        let pool = SenderPool::new();
        let a = pool.sender("127.0.0.1", 9001).await.unwrap();
        let b = pool.sender("127.0.0.1", 9001).await.unwrap();
        let c = pool.sender("127.0.0.1", 9002).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.created_count(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_idempotent() {
        let pool = Arc::new(SenderPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.sender("127.0.0.1", 9100).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.created_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_senders() {
        let pool = SenderPool::new();
        pool.sender("127.0.0.1", 9003).await.unwrap();
        pool.close();

        assert!(pool.is_empty());
        assert!(matches!(
            pool.sender("127.0.0.1", 9003).await,
            Err(BridgeError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_test_reaches_receiver() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let log = MemoryActivityLog::new();
        let sink = ActivitySink::new(Arc::new(log.clone()), 16);
        let resolver = MappingResolver::new(Arc::new(MemoryConfigSource::default()));
        let dispatcher = Dispatcher::new(resolver, Arc::new(SenderPool::new()), sink.clone());

        let command = Command {
            id: 1,
            name: "go".to_string(),
            address: "/cue/go".to_string(),
            args: vec![OscArg::Int(3)],
            category: None,
        };
        let outcome = dispatcher
            .send_test(&command, &target("qlab", "127.0.0.1", port))
            .await;

        assert!(outcome.success);
        assert!(outcome.test);
        assert_eq!(outcome.kind, OutcomeKind::Sent);
        assert_eq!(outcome.device_id, None);

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        let message = osc::decode_message(&buf[..n]).unwrap();
        assert_eq!(message.address, "/cue/go");
        assert_eq!(message.args, vec![OscArg::Int(3)]);

        sink.flush().await;
        assert_eq!(log.outcomes(), vec![outcome]);
    }

    #[tokio::test]
    async fn test_bad_address_reports_failure() {
        let sink = ActivitySink::new(Arc::new(MemoryActivityLog::new()), 16);
        let resolver = MappingResolver::new(Arc::new(MemoryConfigSource::default()));
        let pool = Arc::new(SenderPool::new());
        let dispatcher = Dispatcher::new(resolver, pool.clone(), sink);

        let command = Command {
            id: 1,
            name: "broken".to_string(),
            address: "no-slash".to_string(),
            args: vec![],
            category: None,
        };
        let outcome = dispatcher
            .send_test(&command, &target("t", "127.0.0.1", 9000))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.kind, OutcomeKind::SendFailed);
        assert!(outcome.message.contains("no-slash"));
        // Encoding fails before a sender is needed
        assert_eq!(pool.created_count(), 0);
    }
}
