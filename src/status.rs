//! Shared link-health register.
//!
//! The [`StatusAggregator`] is the single owner of a small boolean
//! [`StatusSnapshot`]. Every component publishes into it through the
//! [`StatusSink`] capability and consumers either read a field or subscribe
//! to changes.
//!
//! # Partial updates
//!
//! A [`StatusUpdate`] only carries the fields that should change. Fields left
//! as `None` keep whatever the last explicit update wrote:
//!
//! ```
//! use sensor_link::status::{StatusAggregator, StatusKey, StatusUpdate};
//!
//! let status = StatusAggregator::new();
//! status.set(StatusUpdate::new().uplink(true));
//! status.set(StatusUpdate::new().control_channel(true));
//!
//! assert!(status.get(StatusKey::Uplink));
//! assert!(status.get(StatusKey::ControlChannel));
//! assert!(!status.get(StatusKey::Cloud));
//! ```
//!
//! # Concurrency
//!
//! The snapshot lives in a `tokio::sync::watch` channel. Writers never hold a
//! lock across an `.await`, so the register is safe on the single-threaded
//! runtime and stays correct if the firmware moves to a multi-threaded one.
//! Subscribers are only woken when an update actually changes the snapshot.

use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

/// Capability for publishing status changes.
///
/// Components depend on this trait instead of on the aggregator itself, so
/// tests can record exactly what was published.
pub trait StatusSink: Send + Sync {
    /// Apply a partial update.
    fn publish(&self, update: StatusUpdate);
}

/// Health of the device's links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// A peer is connected to the control channel.
    #[serde(rename = "bt")]
    pub control_channel_up: bool,
    /// The uplink is associated.
    #[serde(rename = "wifi")]
    pub uplink_up: bool,
    /// Internet reachability, driven by an external collaborator.
    #[serde(rename = "online")]
    pub cloud_up: bool,
    /// Message relay connectivity, driven by an external collaborator.
    #[serde(rename = "mqtt")]
    pub relay_up: bool,
}

impl StatusSnapshot {
    /// Read a single field.
    pub fn get(&self, key: StatusKey) -> bool {
        match key {
            StatusKey::ControlChannel => self.control_channel_up,
            StatusKey::Uplink => self.uplink_up,
            StatusKey::Cloud => self.cloud_up,
            StatusKey::Relay => self.relay_up,
        }
    }

    /// Encode for the connection-status characteristic.
    pub fn to_ble_string(&self) -> String {
        // A struct of four bools always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Names of the snapshot fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKey {
    /// `BT`: control channel session.
    ControlChannel,
    /// `WIFI`: uplink association.
    Uplink,
    /// `ONLINE`: internet reachability.
    Cloud,
    /// `MQTT`: message relay.
    Relay,
}

impl StatusKey {
    /// All keys in display order.
    pub const ALL: [StatusKey; 4] = [Self::ControlChannel, Self::Uplink, Self::Cloud, Self::Relay];

    /// External name of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlChannel => "BT",
            Self::Uplink => "WIFI",
            Self::Cloud => "ONLINE",
            Self::Relay => "MQTT",
        }
    }
}

impl FromStr for StatusKey {
    type Err = InvalidStatusKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BT" => Ok(Self::ControlChannel),
            "WIFI" => Ok(Self::Uplink),
            "ONLINE" => Ok(Self::Cloud),
            "MQTT" => Ok(Self::Relay),
            _ => Err(InvalidStatusKey(s.to_string())),
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A status key name outside `BT`, `WIFI`, `ONLINE`, `MQTT`.
///
/// This signals a programming error in the caller; it is not a runtime
/// condition to recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStatusKey(pub String);

impl fmt::Display for InvalidStatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid status key {:?}, allowed values are BT, WIFI, ONLINE, MQTT",
            self.0
        )
    }
}

impl std::error::Error for InvalidStatusKey {}

/// A partial update: `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub control_channel: Option<bool>,
    pub uplink: Option<bool>,
    pub cloud: Option<bool>,
    pub relay: Option<bool>,
}

impl StatusUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control_channel(mut self, up: bool) -> Self {
        self.control_channel = Some(up);
        self
    }

    pub fn uplink(mut self, up: bool) -> Self {
        self.uplink = Some(up);
        self
    }

    pub fn cloud(mut self, up: bool) -> Self {
        self.cloud = Some(up);
        self
    }

    pub fn relay(mut self, up: bool) -> Self {
        self.relay = Some(up);
        self
    }

    /// Value for `key`, if this update carries one.
    pub fn value(&self, key: StatusKey) -> Option<bool> {
        match key {
            StatusKey::ControlChannel => self.control_channel,
            StatusKey::Uplink => self.uplink,
            StatusKey::Cloud => self.cloud,
            StatusKey::Relay => self.relay,
        }
    }
}

/// Owner of the shared [`StatusSnapshot`].
#[derive(Debug)]
pub struct StatusAggregator {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusAggregator {
    /// Create an aggregator with every field `false`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx }
    }

    /// Apply a partial update, logging each field it names.
    pub fn set(&self, update: StatusUpdate) {
        self.tx.send_if_modified(|snapshot| {
            let mut changed = false;
            for key in StatusKey::ALL {
                let Some(value) = update.value(key) else {
                    continue;
                };
                let field = match key {
                    StatusKey::ControlChannel => &mut snapshot.control_channel_up,
                    StatusKey::Uplink => &mut snapshot.uplink_up,
                    StatusKey::Cloud => &mut snapshot.cloud_up,
                    StatusKey::Relay => &mut snapshot.relay_up,
                };
                if *field != value {
                    info!("{} state updated: {}", key, value);
                    *field = value;
                    changed = true;
                } else {
                    debug!("{} state unchanged: {}", key, value);
                }
            }
            changed
        });
    }

    /// Read one field.
    pub fn get(&self, key: StatusKey) -> bool {
        self.tx.borrow().get(key)
    }

    /// Read one field by its external name.
    pub fn get_by_name(&self, name: &str) -> Result<bool, InvalidStatusKey> {
        let key: StatusKey = name.parse()?;
        Ok(self.get(key))
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        *self.tx.borrow()
    }

    /// Receiver that is woken whenever the snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for StatusAggregator {
    fn publish(&self, update: StatusUpdate) {
        self.set(update);
    }
}

/// Test double that records every published update.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    updates: std::sync::Mutex<Vec<StatusUpdate>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Values published for `key`, in order.
    pub(crate) fn values(&self, key: StatusKey) -> Vec<bool> {
        self.updates()
            .iter()
            .filter_map(|u| u.value(key))
            .collect()
    }
}

#[cfg(test)]
impl StatusSink for RecordingSink {
    fn publish(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_all_down() {
        let status = StatusAggregator::new();
        assert_eq!(status.snapshot(), StatusSnapshot::default());
        for key in StatusKey::ALL {
            assert!(!status.get(key));
        }
    }

    #[test]
    fn test_partial_updates_do_not_clobber() {
        let status = StatusAggregator::new();
        status.set(StatusUpdate::new().relay(true));

        status.set(StatusUpdate::new().uplink(true));
        status.set(StatusUpdate::new().control_channel(true));

        assert_eq!(
            status.snapshot(),
            StatusSnapshot {
                control_channel_up: true,
                uplink_up: true,
                cloud_up: false,
                relay_up: true,
            }
        );
    }

    #[test]
    fn test_empty_update_changes_nothing() {
        let status = StatusAggregator::new();
        status.set(StatusUpdate::new().cloud(true));
        status.set(StatusUpdate::new());
        assert!(status.get(StatusKey::Cloud));
    }

    #[test]
    fn test_get_by_name() {
        let status = StatusAggregator::new();
        status.set(StatusUpdate::new().uplink(true));
        assert_eq!(status.get_by_name("WIFI"), Ok(true));
        assert_eq!(status.get_by_name("BT"), Ok(false));
        assert_eq!(status.get_by_name("ONLINE"), Ok(false));
        assert_eq!(status.get_by_name("MQTT"), Ok(false));
    }

    #[test]
    fn test_get_invalid_key() {
        let status = StatusAggregator::new();
        let err = status.get_by_name("LORA").unwrap_err();
        assert_eq!(err, InvalidStatusKey("LORA".to_string()));
        assert!(err.to_string().contains("BT, WIFI, ONLINE, MQTT"));
    }

    #[test]
    fn test_key_names_are_case_sensitive() {
        assert!("wifi".parse::<StatusKey>().is_err());
        for key in StatusKey::ALL {
            assert_eq!(key.as_str().parse::<StatusKey>(), Ok(key));
        }
    }

    #[test]
    fn test_subscribers_only_see_real_changes() {
        let status = StatusAggregator::new();
        let mut rx = status.subscribe();

        status.set(StatusUpdate::new().uplink(false));
        assert!(!rx.has_changed().unwrap());

        status.set(StatusUpdate::new().uplink(true));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().uplink_up);

        status.set(StatusUpdate::new().uplink(true));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_ble_string() {
        let snapshot = StatusSnapshot {
            control_channel_up: true,
            uplink_up: false,
            cloud_up: false,
            relay_up: true,
        };
        assert_eq!(
            snapshot.to_ble_string(),
            r#"{"bt":true,"wifi":false,"online":false,"mqtt":true}"#
        );
    }
}
