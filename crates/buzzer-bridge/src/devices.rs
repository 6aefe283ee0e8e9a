//! Device presence registry
//!
//! One entry per buzzer hardware address, created the first time a line
//! names the device and never removed. Whether a device is online is decided
//! when the registry is read: an entry whose last observation is older than
//! the staleness window reads as offline even if its stored flag says
//! online, so no timer is needed to expire devices.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::DeviceConfig;
use crate::protocol::{DiscoveryMode, PresenceUpdate};

/// Stored state of one buzzer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Hardware address
    pub device_id: String,
    /// Last reported online flag
    pub online: bool,
    /// Last reported armed flag
    pub armed: bool,
    /// Last reported pressed flag
    pub pressed: bool,
    /// Presses observed (or reported, whichever is larger)
    pub press_count: u64,
    /// Last time any line referenced this device
    pub last_seen_at: DateTime<Utc>,
    /// Last time the device was observed online; never moves backwards
    pub last_online_at: Option<DateTime<Utc>>,
    /// Time of the last press
    pub last_press_at: Option<DateTime<Utc>>,
    /// How presence was most recently learned
    pub discovery_mode: DiscoveryMode,
}

impl DeviceState {
    fn new(device_id: &str, mode: DiscoveryMode, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            online: true,
            armed: false,
            pressed: false,
            press_count: 0,
            last_seen_at: now,
            last_online_at: None,
            last_press_at: None,
            discovery_mode: mode,
        }
    }

    fn mark_online(&mut self, at: DateTime<Utc>) {
        self.online = true;
        if self.last_online_at.map_or(true, |prev| at > prev) {
            self.last_online_at = Some(at);
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }
}

/// Read-time projection of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceView {
    /// Hardware address
    pub device_id: String,
    /// Effective online flag after the staleness check
    pub online: bool,
    /// True when the stored flag says online but the device went quiet
    pub stale: bool,
    /// Armed flag
    pub armed: bool,
    /// Pressed flag
    pub pressed: bool,
    /// Press count
    pub press_count: u64,
    /// Last observation
    pub last_seen_at: DateTime<Utc>,
    /// Last observed online
    pub last_online_at: Option<DateTime<Utc>>,
    /// Last press
    pub last_press_at: Option<DateTime<Utc>>,
    /// Discovery mode
    pub discovery_mode: DiscoveryMode,
}

impl DeviceView {
    fn project(state: &DeviceState, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let quiet_for = now
            .signed_duration_since(state.last_seen_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stale = state.online && quiet_for > stale_after;

        Self {
            device_id: state.device_id.clone(),
            online: state.online && !stale,
            stale,
            armed: state.armed,
            pressed: state.pressed,
            press_count: state.press_count,
            last_seen_at: state.last_seen_at,
            last_online_at: state.last_online_at,
            last_press_at: state.last_press_at,
            discovery_mode: state.discovery_mode,
        }
    }
}

/// Heartbeat marker for a coordinator slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMark {
    /// Coordinator slot number
    pub slot: u32,
    /// When the heartbeat was seen
    pub at: DateTime<Utc>,
}

/// Registry of every device the coordinator has mentioned
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceState>,
    heartbeats: HashMap<u32, DateTime<Utc>>,
    last_heartbeat: Option<HeartbeatMark>,
    stale_after: Duration,
}

impl DeviceRegistry {
    /// Create an empty registry with the given staleness window
    pub fn new(stale_after: Duration) -> Self {
        Self {
            devices: BTreeMap::new(),
            heartbeats: HashMap::new(),
            last_heartbeat: None,
            stale_after,
        }
    }

    /// Create from device configuration
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.stale_after)
    }

    /// Staleness window
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Apply a presence update
    ///
    /// An inferred update on a known device only refreshes liveness; it never
    /// clears press history or explicitly reported flags.
    pub fn record_presence(
        &mut self,
        device_id: &str,
        update: &PresenceUpdate,
        mode: DiscoveryMode,
        now: DateTime<Utc>,
    ) -> DeviceView {
        let stale_after = self.stale_after;
        let state = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!(device_id, ?mode, "New device observed");
                DeviceState::new(device_id, mode, now)
            });

        state.touch(now);
        state.discovery_mode = mode;

        match update.online {
            Some(true) => state.mark_online(now),
            Some(false) => state.online = false,
            // An announcement without a flag still means the device is talking
            None => state.mark_online(now),
        }
        if let Some(armed) = update.armed {
            state.armed = armed;
        }
        if let Some(pressed) = update.pressed {
            state.pressed = pressed;
        }
        if let Some(presses) = update.presses {
            state.press_count = state.press_count.max(presses);
        }

        trace!(device_id, online = state.online, armed = state.armed, "Presence recorded");
        DeviceView::project(state, now, stale_after)
    }

    /// Record a press
    ///
    /// `timestamp_ms` is the coordinator's clock; when absent the local
    /// receive time is used.
    pub fn record_press(
        &mut self,
        device_id: &str,
        timestamp_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> DeviceView {
        let stale_after = self.stale_after;
        let state = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!(device_id, "New device observed via press");
                DeviceState::new(device_id, DiscoveryMode::Normal, now)
            });

        let pressed_at = timestamp_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(now);

        state.touch(now);
        state.mark_online(now);
        state.pressed = true;
        state.press_count += 1;
        state.last_press_at = Some(pressed_at);

        DeviceView::project(state, now, stale_after)
    }

    /// Remember a slot heartbeat; does not create or touch any device
    pub fn record_heartbeat(&mut self, slot: u32, now: DateTime<Utc>) -> HeartbeatMark {
        self.heartbeats.insert(slot, now);
        let mark = HeartbeatMark { slot, at: now };
        self.last_heartbeat = Some(mark);
        mark
    }

    /// Most recent heartbeat from any slot
    pub fn last_heartbeat(&self) -> Option<HeartbeatMark> {
        self.last_heartbeat
    }

    /// Most recent heartbeat from one slot
    pub fn slot_heartbeat(&self, slot: u32) -> Option<DateTime<Utc>> {
        self.heartbeats.get(&slot).copied()
    }

    /// Stored state of one device
    pub fn get(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    /// Project one device at `now`
    pub fn view(&self, device_id: &str, now: DateTime<Utc>) -> Option<DeviceView> {
        self.devices
            .get(device_id)
            .map(|state| DeviceView::project(state, now, self.stale_after))
    }

    /// Project every device at `now`, ordered by identifier
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<DeviceView> {
        self.devices
            .values()
            .map(|state| DeviceView::project(state, now, self.stale_after))
            .collect()
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been observed
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const MAC: &str = "11:22:33:44:55:66";

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn device(online: bool) -> PresenceUpdate {
        PresenceUpdate {
            online: Some(online),
            armed: Some(false),
            pressed: Some(false),
            presses: None,
        }
    }

    #[test]
    fn test_unknown_device_is_absent() {
        let registry = DeviceRegistry::default();
        assert!(registry.get("never:seen").is_none());
        assert!(registry.view("never:seen", t0()).is_none());
        assert!(registry.snapshot(t0()).is_empty());
    }

    #[test]
    fn test_offline_preserves_last_online() {
        let mut registry = DeviceRegistry::default();
        registry.record_presence(MAC, &device(true), DiscoveryMode::Normal, t0());
        let later = t0() + ChronoDuration::seconds(5);
        registry.record_presence(
            MAC,
            &PresenceUpdate {
                online: Some(false),
                ..PresenceUpdate::default()
            },
            DiscoveryMode::Normal,
            later,
        );

        let snapshot = registry.snapshot(later);
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].online);
        assert_eq!(snapshot[0].last_online_at, Some(t0()));
    }

    #[test]
    fn test_last_online_is_monotonic() {
        let mut registry = DeviceRegistry::default();
        let later = t0() + ChronoDuration::seconds(30);
        registry.record_presence(MAC, &device(true), DiscoveryMode::Normal, later);
        // An update stamped earlier (clock skew) must not move it back
        registry.record_presence(MAC, &device(true), DiscoveryMode::Normal, t0());

        assert_eq!(registry.get(MAC).unwrap().last_online_at, Some(later));
        assert_eq!(registry.get(MAC).unwrap().last_seen_at, later);
    }

    #[test]
    fn test_staleness_is_a_read_time_projection() {
        let mut registry = DeviceRegistry::new(Duration::from_secs(60));
        registry.record_presence(MAC, &device(true), DiscoveryMode::Normal, t0());

        let fresh = registry.view(MAC, t0() + ChronoDuration::seconds(59)).unwrap();
        assert!(fresh.online);
        assert!(!fresh.stale);

        let stale = registry.view(MAC, t0() + ChronoDuration::seconds(61)).unwrap();
        assert!(!stale.online);
        assert!(stale.stale);

        // Stored flag is untouched
        assert!(registry.get(MAC).unwrap().online);
    }

    #[test]
    fn test_press_updates_counters() {
        let mut registry = DeviceRegistry::default();
        let view = registry.record_press(MAC, Some(1_700_000_000_500), t0());

        assert_eq!(view.press_count, 1);
        assert!(view.pressed);
        assert!(view.online);
        assert_eq!(
            view.last_press_at,
            Some(Utc.timestamp_millis_opt(1_700_000_000_500).unwrap())
        );

        let view = registry.record_press(MAC, None, t0() + ChronoDuration::seconds(1));
        assert_eq!(view.press_count, 2);
        assert_eq!(view.last_press_at, Some(t0() + ChronoDuration::seconds(1)));
    }

    #[test]
    fn test_inferred_presence_preserves_history() {
        let mut registry = DeviceRegistry::default();
        registry.record_press(MAC, None, t0());
        registry.record_press(MAC, None, t0());
        registry.record_presence(
            MAC,
            &PresenceUpdate {
                armed: Some(true),
                ..device(true)
            },
            DiscoveryMode::Normal,
            t0(),
        );

        let later = t0() + ChronoDuration::seconds(2);
        let view = registry.record_presence(
            MAC,
            &PresenceUpdate::seen_online(),
            DiscoveryMode::HeartbeatInferred,
            later,
        );
        assert_eq!(view.press_count, 2);
        assert_eq!(view.last_press_at, Some(t0()));
        assert!(view.armed);
        assert_eq!(view.discovery_mode, DiscoveryMode::HeartbeatInferred);

        // Explicit announcement afterwards keeps the history too
        let view = registry.record_presence(MAC, &device(true), DiscoveryMode::Normal, later);
        assert_eq!(view.press_count, 2);
        assert_eq!(view.discovery_mode, DiscoveryMode::Normal);
    }

    #[test]
    fn test_reported_presses_never_lower_count() {
        let mut registry = DeviceRegistry::default();
        for _ in 0..3 {
            registry.record_press(MAC, None, t0());
        }
        let update = PresenceUpdate {
            presses: Some(1),
            ..PresenceUpdate::default()
        };
        let view = registry.record_presence(MAC, &update, DiscoveryMode::Normal, t0());
        assert_eq!(view.press_count, 3);

        let update = PresenceUpdate {
            presses: Some(10),
            ..PresenceUpdate::default()
        };
        let view = registry.record_presence(MAC, &update, DiscoveryMode::Normal, t0());
        assert_eq!(view.press_count, 10);
    }

    #[test]
    fn test_heartbeat_does_not_create_devices() {
        let mut registry = DeviceRegistry::default();
        registry.record_heartbeat(4, t0());

        assert!(registry.is_empty());
        assert_eq!(registry.last_heartbeat(), Some(HeartbeatMark { slot: 4, at: t0() }));
        assert_eq!(registry.slot_heartbeat(4), Some(t0()));
        assert_eq!(registry.slot_heartbeat(5), None);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let mut registry = DeviceRegistry::default();
        for mac in ["CC:00", "AA:00", "BB:00"] {
            registry.record_presence(mac, &device(true), DiscoveryMode::Normal, t0());
        }
        let ids: Vec<_> = registry
            .snapshot(t0())
            .into_iter()
            .map(|v| v.device_id)
            .collect();
        assert_eq!(ids, vec!["AA:00", "BB:00", "CC:00"]);
    }
}
