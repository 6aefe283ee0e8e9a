//! Coordinator line protocol
//!
//! The coordinator firmware prints one record per line. Several firmware
//! revisions are in the field, so the parser accepts a handful of
//! overlapping shapes and degrades field-by-field rather than line-by-line:
//!
//! | Shape | Result |
//! |-------|--------|
//! | `BUZZER:<id>,<epoch_ms>` | [`LineEvent::Press`] |
//! | `STATUS:<k=v>,...` | [`LineEvent::Status`] |
//! | `DEVICE:<id>,<k=v>,...` | [`LineEvent::Presence`] |
//! | `...Heartbeat from device <N>...` | [`LineEvent::Heartbeat`] |
//! | `...Received <n> bytes from: <mac>...` | [`LineEvent::Presence`] (inferred) |
//! | `ACK:<text>` | [`LineEvent::Ack`] |
//! | `ERROR:<text>` | [`LineEvent::DeviceError`] |
//! | anything else | [`LineEvent::Unrecognized`] |
//!
//! Shapes are tried in the order above.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

use crate::error::BridgeError;

const PRESS_PREFIX: &str = "BUZZER:";
const STATUS_PREFIX: &str = "STATUS:";
const DEVICE_PREFIX: &str = "DEVICE:";
const ACK_PREFIX: &str = "ACK:";
const ERROR_PREFIX: &str = "ERROR:";
const HEARTBEAT_MARKER: &str = "Heartbeat from device ";
const RECEIVED_MARKER: &str = "Received ";
const BYTES_FROM_MARKER: &str = " bytes from:";

/// How a device's presence was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Explicit `DEVICE:` announcement
    Normal,
    /// Synthesized from radio traffic without an explicit announcement
    HeartbeatInferred,
}

/// Where a press event entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressSource {
    /// Read from the coordinator link (real or simulated)
    Coordinator,
    /// Injected by an operator for testing
    Injected,
}

/// A buzzer press
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressEvent {
    /// Hardware address of the buzzer
    pub device_id: String,
    /// Coordinator timestamp in epoch milliseconds, if it was readable
    pub timestamp_ms: Option<u64>,
    /// Origin of the press
    pub source: PressSource,
}

impl PressEvent {
    /// Create a press read from the coordinator
    pub fn new(device_id: impl Into<String>, timestamp_ms: Option<u64>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms,
            source: PressSource::Coordinator,
        }
    }

    /// Create an operator-injected press
    pub fn injected(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms: None,
            source: PressSource::Injected,
        }
    }
}

/// Presence fields carried by `DEVICE:` lines
///
/// Absent fields leave the stored device state untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// `online=`
    pub online: Option<bool>,
    /// `armed=`
    pub armed: Option<bool>,
    /// `pressed=`
    pub pressed: Option<bool>,
    /// `presses=`, the coordinator's own press counter
    pub presses: Option<u64>,
}

impl PresenceUpdate {
    /// The update implied by radio traffic from a device
    pub fn seen_online() -> Self {
        Self {
            online: Some(true),
            ..Self::default()
        }
    }
}

/// Keys understood in `STATUS:` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKey {
    /// Coordinator armed state
    Armed,
    /// Number of paired devices
    Devices,
    /// Number of devices currently online
    Online,
    /// Coordinator uptime
    Uptime,
    /// Radio channel
    Channel,
    /// Operating mode
    Mode,
    /// Firmware version
    Version,
}

impl FromStr for StatusKey {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "armed" => Ok(Self::Armed),
            "devices" => Ok(Self::Devices),
            "online" => Ok(Self::Online),
            "uptime" => Ok(Self::Uptime),
            "channel" => Ok(Self::Channel),
            "mode" => Ok(Self::Mode),
            "version" => Ok(Self::Version),
            _ => Err(()),
        }
    }
}

/// A `STATUS:` value: integers stay integers, everything else is text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    /// Integer value
    Int(i64),
    /// Any other value
    Text(String),
}

impl StatusValue {
    fn decode(raw: &str) -> Self {
        raw.parse::<i64>()
            .map(StatusValue::Int)
            .unwrap_or_else(|_| StatusValue::Text(raw.to_string()))
    }

    /// Integer view of the value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatusValue::Int(v) => Some(*v),
            StatusValue::Text(_) => None,
        }
    }
}

/// Decoded coordinator status report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Recognized fields
    pub fields: BTreeMap<StatusKey, StatusValue>,
}

impl StatusReport {
    /// Look up a field
    pub fn get(&self, key: StatusKey) -> Option<&StatusValue> {
        self.fields.get(&key)
    }
}

/// One classified coordinator line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A buzzer was pressed
    Press(PressEvent),
    /// Coordinator status report
    Status {
        /// Decoded fields
        report: StatusReport,
        /// Fragments that were skipped
        ignored: Vec<String>,
    },
    /// Device presence update
    Presence {
        /// Hardware address
        device_id: String,
        /// Reported fields
        update: PresenceUpdate,
        /// How presence was learned
        mode: DiscoveryMode,
        /// Fragments that were skipped
        ignored: Vec<String>,
    },
    /// Low-fidelity liveness signal naming only a device slot
    Heartbeat {
        /// Coordinator slot number
        slot: u32,
    },
    /// Command acknowledgement
    Ack(String),
    /// Error reported by the coordinator
    DeviceError(String),
    /// Line that matched no known shape
    Unrecognized(String),
}

impl LineEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            LineEvent::Press(_) => "press",
            LineEvent::Status { .. } => "status",
            LineEvent::Presence { .. } => "presence",
            LineEvent::Heartbeat { .. } => "heartbeat",
            LineEvent::Ack(_) => "ack",
            LineEvent::DeviceError(_) => "device_error",
            LineEvent::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Classify one line from the coordinator
///
/// Never fails: anything that cannot be understood becomes
/// [`LineEvent::Unrecognized`].
pub fn parse_line(raw: &str) -> LineEvent {
    let line = raw.trim();

    let event = if let Some(rest) = line.strip_prefix(PRESS_PREFIX) {
        parse_press(rest)
    } else if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
        parse_status(rest)
    } else if let Some(rest) = line.strip_prefix(DEVICE_PREFIX) {
        parse_device(rest)
    } else if line.contains(HEARTBEAT_MARKER) {
        parse_heartbeat(line)
    } else if line.contains(BYTES_FROM_MARKER) && line.contains(RECEIVED_MARKER) {
        parse_bytes_received(line)
    } else if let Some(rest) = line.strip_prefix(ACK_PREFIX) {
        Some(LineEvent::Ack(rest.trim().to_string()))
    } else if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        Some(LineEvent::DeviceError(rest.trim().to_string()))
    } else {
        None
    };

    let event = event.unwrap_or_else(|| LineEvent::Unrecognized(line.to_string()));
    trace!(kind = event.kind(), line, "Parsed coordinator line");
    event
}

fn parse_press(rest: &str) -> Option<LineEvent> {
    let (id, stamp) = match rest.split_once(',') {
        Some((id, stamp)) => (id.trim(), Some(stamp.trim())),
        None => (rest.trim(), None),
    };
    if id.is_empty() {
        return None;
    }

    let timestamp_ms = stamp.and_then(|s| match s.parse::<u64>() {
        Ok(ms) => Some(ms),
        Err(_) => {
            debug!(device_id = id, raw = s, "Unreadable press timestamp");
            None
        }
    });

    Some(LineEvent::Press(PressEvent::new(id, timestamp_ms)))
}

/// Split `k=v` fragments, handing each well-formed pair to `apply`.
///
/// `apply` returns false when it does not understand the pair; those
/// fragments, and fragments without `=`, are collected as ignored.
fn decode_pairs<'a>(
    fragments: impl Iterator<Item = &'a str>,
    mut apply: impl FnMut(&str, &str) -> bool,
) -> Vec<String> {
    let mut ignored = Vec::new();
    for fragment in fragments.map(str::trim).filter(|f| !f.is_empty()) {
        let accepted = match fragment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => apply(key.trim(), value.trim()),
            _ => false,
        };
        if !accepted {
            debug!(fragment, "Ignoring key=value fragment");
            ignored.push(fragment.to_string());
        }
    }
    ignored
}

fn parse_status(rest: &str) -> Option<LineEvent> {
    let mut report = StatusReport::default();
    let ignored = decode_pairs(rest.split(','), |key, value| match key.parse::<StatusKey>() {
        Ok(key) => {
            report.fields.insert(key, StatusValue::decode(value));
            true
        }
        Err(()) => false,
    });
    Some(LineEvent::Status { report, ignored })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn parse_device(rest: &str) -> Option<LineEvent> {
    let mut parts = rest.split(',');
    let device_id = parts.next().map(str::trim).unwrap_or_default();
    if device_id.is_empty() {
        debug!(line = rest, "Discarding DEVICE line without identifier");
        return None;
    }

    let mut update = PresenceUpdate::default();
    let ignored = decode_pairs(parts, |key, value| {
        let slot = match key {
            "online" => &mut update.online,
            "armed" => &mut update.armed,
            "pressed" => &mut update.pressed,
            "presses" => {
                return value
                    .parse::<u64>()
                    .map(|n| update.presses = Some(n))
                    .is_ok()
            }
            _ => return false,
        };
        match parse_flag(value) {
            Some(flag) => {
                *slot = Some(flag);
                true
            }
            None => false,
        }
    });

    Some(LineEvent::Presence {
        device_id: device_id.to_string(),
        update,
        mode: DiscoveryMode::Normal,
        ignored,
    })
}

fn parse_heartbeat(line: &str) -> Option<LineEvent> {
    let (_, after) = line.split_once(HEARTBEAT_MARKER)?;
    let digits: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let slot = digits.parse::<u32>().ok()?;
    Some(LineEvent::Heartbeat { slot })
}

fn parse_bytes_received(line: &str) -> Option<LineEvent> {
    let (head, tail) = line.split_once(BYTES_FROM_MARKER)?;
    let (_, count) = head.rsplit_once(RECEIVED_MARKER)?;
    count.trim().parse::<u64>().ok()?;

    let device_id = tail.split_whitespace().next()?;
    Some(LineEvent::Presence {
        device_id: device_id.to_string(),
        update: PresenceUpdate::seen_online(),
        mode: DiscoveryMode::HeartbeatInferred,
        ignored: Vec::new(),
    })
}

/// Commands the coordinator accepts on its serial console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorCommand {
    /// Request a status report
    Status,
    /// Ask devices to announce themselves
    Scan,
    /// Arm buzzers; an optional suffix selects a firmware-specific variant
    Arm(Option<String>),
    /// Disarm buzzers
    Disarm,
}

impl fmt::Display for CoordinatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorCommand::Status => write!(f, "STATUS"),
            CoordinatorCommand::Scan => write!(f, "SCAN"),
            CoordinatorCommand::Arm(None) => write!(f, "ARM"),
            CoordinatorCommand::Arm(Some(suffix)) => write!(f, "ARM{}", suffix),
            CoordinatorCommand::Disarm => write!(f, "DISARM"),
        }
    }
}

impl FromStr for CoordinatorCommand {
    type Err = BridgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "STATUS" => Ok(Self::Status),
            "SCAN" => Ok(Self::Scan),
            "DISARM" => Ok(Self::Disarm),
            "ARM" => Ok(Self::Arm(None)),
            _ => match s.strip_prefix("ARM") {
                Some(suffix) if !suffix.chars().any(char::is_whitespace) => {
                    Ok(Self::Arm(Some(suffix.to_string())))
                }
                _ => Err(BridgeError::UnknownCommand(s.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_line() {
        let event = parse_line("BUZZER:AA:BB:CC:DD:EE:FF,1700000000000");
        assert_eq!(
            event,
            LineEvent::Press(PressEvent::new("AA:BB:CC:DD:EE:FF", Some(1_700_000_000_000)))
        );
    }

    #[test]
    fn test_press_with_bad_timestamp_keeps_press() {
        match parse_line("BUZZER:AA:BB:CC:DD:EE:FF,soon\r\n") {
            LineEvent::Press(press) => {
                assert_eq!(press.device_id, "AA:BB:CC:DD:EE:FF");
                assert_eq!(press.timestamp_ms, None);
            }
            other => panic!("expected press, got {:?}", other),
        }

        match parse_line("BUZZER:AA:BB:CC:DD:EE:FF") {
            LineEvent::Press(press) => assert_eq!(press.timestamp_ms, None),
            other => panic!("expected press, got {:?}", other),
        }
    }

    #[test]
    fn test_press_without_id_is_unrecognized() {
        assert!(matches!(
            parse_line("BUZZER:,123"),
            LineEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn test_status_skips_malformed_pairs() {
        match parse_line("STATUS:armed=1,garbage,mode=race,devices=4,colour=red") {
            LineEvent::Status { report, ignored } => {
                assert_eq!(report.get(StatusKey::Armed), Some(&StatusValue::Int(1)));
                assert_eq!(report.get(StatusKey::Devices), Some(&StatusValue::Int(4)));
                assert_eq!(
                    report.get(StatusKey::Mode),
                    Some(&StatusValue::Text("race".to_string()))
                );
                assert_eq!(ignored, vec!["garbage", "colour=red"]);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_device_line_coerces_flags() {
        match parse_line("DEVICE:11:22:33:44:55:66,online=1,armed=0,pressed=0,presses=7") {
            LineEvent::Presence {
                device_id,
                update,
                mode,
                ignored,
            } => {
                assert_eq!(device_id, "11:22:33:44:55:66");
                assert_eq!(update.online, Some(true));
                assert_eq!(update.armed, Some(false));
                assert_eq!(update.pressed, Some(false));
                assert_eq!(update.presses, Some(7));
                assert_eq!(mode, DiscoveryMode::Normal);
                assert!(ignored.is_empty());
            }
            other => panic!("expected presence, got {:?}", other),
        }
    }

    #[test]
    fn test_device_line_skips_bad_field_only() {
        match parse_line("DEVICE:11:22:33:44:55:66,online=maybe,armed=1,rssi=-40") {
            LineEvent::Presence {
                update, ignored, ..
            } => {
                assert_eq!(update.online, None);
                assert_eq!(update.armed, Some(true));
                assert_eq!(ignored, vec!["online=maybe", "rssi=-40"]);
            }
            other => panic!("expected presence, got {:?}", other),
        }
    }

    #[test]
    fn test_device_line_without_id_is_discarded() {
        assert!(matches!(
            parse_line("DEVICE:,online=1"),
            LineEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn test_heartbeat_line() {
        assert_eq!(
            parse_line("[radio] Heartbeat from device 3 (rssi -52)"),
            LineEvent::Heartbeat { slot: 3 }
        );
        assert!(matches!(
            parse_line("Heartbeat from device unknown"),
            LineEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn test_bytes_received_infers_presence() {
        match parse_line("ESP-NOW: Received 12 bytes from: 24:6F:28:AA:BB:CC") {
            LineEvent::Presence {
                device_id,
                update,
                mode,
                ..
            } => {
                assert_eq!(device_id, "24:6F:28:AA:BB:CC");
                assert_eq!(update, PresenceUpdate::seen_online());
                assert_eq!(mode, DiscoveryMode::HeartbeatInferred);
            }
            other => panic!("expected presence, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_error_and_unknown() {
        assert_eq!(parse_line("ACK:ARM"), LineEvent::Ack("ARM".to_string()));
        assert_eq!(
            parse_line("ERROR:radio init failed"),
            LineEvent::DeviceError("radio init failed".to_string())
        );
        assert_eq!(
            parse_line("boot: rst:0x1 (POWERON_RESET)"),
            LineEvent::Unrecognized("boot: rst:0x1 (POWERON_RESET)".to_string())
        );
    }

    #[test]
    fn test_prefix_priority() {
        // A press line mentioning a heartbeat is still a press
        assert!(matches!(
            parse_line("BUZZER:Heartbeat from device 1,5"),
            LineEvent::Press(_)
        ));
    }

    #[test]
    fn test_command_wire_format() {
        assert_eq!(CoordinatorCommand::Status.to_string(), "STATUS");
        assert_eq!(CoordinatorCommand::Arm(None).to_string(), "ARM");
        assert_eq!(
            CoordinatorCommand::Arm(Some("_ALL".to_string())).to_string(),
            "ARM_ALL"
        );
        assert_eq!(
            "ARM2".parse::<CoordinatorCommand>().unwrap(),
            CoordinatorCommand::Arm(Some("2".to_string()))
        );
        assert_eq!(
            " DISARM ".parse::<CoordinatorCommand>().unwrap(),
            CoordinatorCommand::Disarm
        );
        assert!("REBOOT".parse::<CoordinatorCommand>().is_err());
    }
}
