//! BLE control channel.
//!
//! A phone connects over BLE to provision uplink credentials, exchange short
//! text messages and watch the device's link status.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service 05154878-a92f-447f-9056-cfba8eec8b0e
//! ├── SSID (Read, Write, Notify, Indicate) - uplink network name, max 32 bytes
//! ├── Password (Read, Write, Notify, Indicate) - uplink passphrase, max 64 bytes
//! ├── Connection status (Read, Notify, Indicate) - JSON status snapshot
//! ├── Message in (Read, Notify, Indicate) - device to peer text
//! ├── Message out (Read, Write, Notify) - peer to device text, max 512 bytes
//! └── Device ID (Read, Notify, Indicate) - device identity
//! ```
//!
//! # Components
//!
//! - [`ControlChannel`] - advertise loop, write observers and status mirror
//! - [`ControlRadio`] - the GATT server the channel runs on
//! - [`handlers`] - capabilities invoked when a peer writes
//! - [`NimbleRadio`] - esp32-nimble GATT server (ESP32 only)

mod channel;
pub mod handlers;
#[cfg(feature = "esp32")]
mod nimble;

pub use channel::ControlChannel;
pub use handlers::{LogMessageSink, MessageSink, Provisioning, WriteHandler};
#[cfg(feature = "esp32")]
pub use nimble::NimbleRadio;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::BitOr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Control service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x05154878_a92f_447f_9056_cfba8eec8b0e);

/// A characteristic of the control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Ssid,
    Password,
    ConnectionStatus,
    /// Device to peer.
    MessageIn,
    /// Peer to device.
    MessageOut,
    DeviceId,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Self::Ssid,
        Self::Password,
        Self::ConnectionStatus,
        Self::MessageIn,
        Self::MessageOut,
        Self::DeviceId,
    ];

    /// Characteristics a peer can write.
    pub const WRITABLE: [Characteristic; 3] = [Self::Ssid, Self::Password, Self::MessageOut];

    pub fn uuid(&self) -> Uuid {
        let value = match self {
            Self::Ssid => 0x1dee4fcb_7ac0_4520_81de_9cbbff27af73,
            Self::Password => 0x4273c7a7_6605_4d55_8ab0_79e114c09baa,
            Self::ConnectionStatus => 0xdb27e855_4588_4a31_a76d_20e7d3bf0ed9,
            Self::MessageIn => 0x0e29a826_7389_4aaa_9aa3_bccb80e34c86,
            Self::MessageOut => 0xac7793c6_3a8d_4726_9f26_c8a7e8ee934b,
            Self::DeviceId => 0x4df4e89c_c438_4052_9cbe_4cf42529fab1,
        };
        Uuid::from_u128(value)
    }

    pub fn properties(&self) -> Properties {
        use Properties as P;
        match self {
            Self::Ssid | Self::Password => P::READ | P::WRITE | P::NOTIFY | P::INDICATE,
            Self::ConnectionStatus | Self::MessageIn | Self::DeviceId => {
                P::READ | P::NOTIFY | P::INDICATE
            }
            Self::MessageOut => P::READ | P::WRITE | P::NOTIFY,
        }
    }

    /// Largest accepted write, for writable characteristics.
    pub fn max_len(&self) -> Option<usize> {
        match self {
            Self::Ssid => Some(crate::credentials::MAX_SSID_LEN),
            Self::Password => Some(crate::credentials::MAX_PASSWORD_LEN),
            Self::MessageOut => Some(512),
            _ => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.properties().contains(Properties::WRITE)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::Password => "password",
            Self::ConnectionStatus => "status",
            Self::MessageIn => "msg-in",
            Self::MessageOut => "msg-out",
            Self::DeviceId => "device-id",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GATT characteristic property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties(u8);

impl Properties {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const NOTIFY: Self = Self(1 << 2);
    pub const INDICATE: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for Properties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What the device advertises while waiting for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub service: Uuid,
    pub interval: Duration,
}

/// GATT server hosting the control service.
///
/// Synchronous calls must return promptly. Async calls are cancelled by
/// dropping the future.
pub trait ControlRadio: Send + Sync + 'static {
    type Session: PeerSession;

    fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), LinkError>;

    fn stop_advertising(&self) -> Result<(), LinkError>;

    /// Wait for a peer to connect.
    fn accept(&self) -> impl Future<Output = Result<Self::Session, LinkError>> + Send;

    /// Wait for the next peer write to any of `characteristics`.
    ///
    /// Writes are returned in the order the peer made them, across all the
    /// listed characteristics.
    fn written(
        &self,
        characteristics: &[Characteristic],
    ) -> impl Future<Output = Result<(Characteristic, Vec<u8>), LinkError>> + Send;

    /// Set a characteristic's value and notify subscribed peers.
    fn set_value(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), LinkError>;
}

/// A connected peer.
pub trait PeerSession: Send {
    /// Peer address or name, for logging.
    fn peer(&self) -> String;

    /// Resolves once the peer has gone.
    fn disconnected(&mut self) -> impl Future<Output = ()> + Send;

    /// Drop the connection from our side. Idempotent.
    fn close(&mut self);
}

/// Transient control-link failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The BLE stack reported an error.
    Stack(String),
    /// The characteristic does not accept writes.
    NotWritable(Characteristic),
    /// The radio was shut down.
    Closed,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack(msg) => write!(f, "BLE stack error: {}", msg),
            Self::NotWritable(ch) => write!(f, "characteristic {} is not writable", ch),
            Self::Closed => write!(f, "radio closed"),
        }
    }
}

impl std::error::Error for LinkError {}

/// A peer write that is not acceptable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Longer than the characteristic allows.
    Oversized { len: usize, max: usize },
    /// Not valid UTF-8.
    InvalidUtf8(std::str::Utf8Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized { len, max } => {
                write!(f, "payload too long: {} bytes (max {})", len, max)
            }
            Self::InvalidUtf8(e) => write!(f, "invalid UTF-8: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUtf8(e) => Some(e),
            Self::Oversized { .. } => None,
        }
    }
}

/// Decode a peer write as text, checking length before allocating.
pub fn decode_text(characteristic: Characteristic, data: &[u8]) -> Result<String, DecodeError> {
    if let Some(max) = characteristic.max_len() {
        if data.len() > max {
            return Err(DecodeError::Oversized {
                len: data.len(),
                max,
            });
        }
    }
    let text = std::str::from_utf8(data).map_err(DecodeError::InvalidUtf8)?;
    Ok(text.to_string())
}

/// Peer writes in arrival order, fed by the BLE stack's write callbacks and
/// drained by [`ControlRadio::written`].
pub(crate) struct WriteQueues {
    pending: Mutex<VecDeque<(Characteristic, Vec<u8>)>>,
    arrived: Notify,
}

impl WriteQueues {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
        }
    }

    pub(crate) fn push(&self, ch: Characteristic, data: Vec<u8>) -> Result<(), LinkError> {
        if !ch.is_writable() {
            return Err(LinkError::NotWritable(ch));
        }
        self.lock().push_back((ch, data));
        self.arrived.notify_waiters();
        Ok(())
    }

    /// Oldest pending write to any of `chs`.
    pub(crate) async fn recv(
        &self,
        chs: &[Characteristic],
    ) -> Result<(Characteristic, Vec<u8>), LinkError> {
        if let Some(&ch) = chs.iter().find(|ch| !ch.is_writable()) {
            return Err(LinkError::NotWritable(ch));
        }
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            // Register before checking so a push in between is not missed.
            arrived.as_mut().enable();
            if let Some(write) = self.take(chs) {
                return Ok(write);
            }
            arrived.await;
        }
    }

    fn take(&self, chs: &[Characteristic]) -> Option<(Characteristic, Vec<u8>)> {
        let mut pending = self.lock();
        let index = pending.iter().position(|(ch, _)| chs.contains(ch))?;
        pending.remove(index)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(Characteristic, Vec<u8>)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_six_characteristics_three_writable() {
        assert_eq!(Characteristic::ALL.len(), 6);
        let writable: Vec<_> = Characteristic::ALL
            .into_iter()
            .filter(|ch| ch.is_writable())
            .collect();
        assert_eq!(writable, Characteristic::WRITABLE.to_vec());
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "05154878-a92f-447f-9056-cfba8eec8b0e"
        );
        assert_eq!(
            Characteristic::Ssid.uuid().to_string(),
            "1dee4fcb-7ac0-4520-81de-9cbbff27af73"
        );
        assert_eq!(
            Characteristic::DeviceId.uuid().to_string(),
            "4df4e89c-c438-4052-9cbe-4cf42529fab1"
        );
        let mut uuids: Vec<_> = Characteristic::ALL.iter().map(|ch| ch.uuid()).collect();
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), 6);
    }

    #[test]
    fn test_message_out_does_not_indicate() {
        let props = Characteristic::MessageOut.properties();
        assert!(props.contains(Properties::WRITE | Properties::NOTIFY));
        assert!(!props.contains(Properties::INDICATE));
        assert!(!Characteristic::ConnectionStatus
            .properties()
            .contains(Properties::WRITE));
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(
            decode_text(Characteristic::Ssid, b"HomeNet"),
            Ok("HomeNet".to_string())
        );
        assert!(matches!(
            decode_text(Characteristic::Ssid, &[0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8(_))
        ));
        assert_eq!(
            decode_text(Characteristic::Ssid, &[b'a'; 33]),
            Err(DecodeError::Oversized { len: 33, max: 32 })
        );
        assert!(decode_text(Characteristic::MessageOut, &[b'a'; 512]).is_ok());
    }

    #[tokio::test]
    async fn test_write_queues() {
        let queues = WriteQueues::new();
        queues.push(Characteristic::Ssid, b"a".to_vec()).unwrap();
        queues.push(Characteristic::Ssid, b"b".to_vec()).unwrap();
        assert_eq!(
            queues.recv(&[Characteristic::Ssid]).await.unwrap(),
            (Characteristic::Ssid, b"a".to_vec())
        );
        assert_eq!(
            queues.recv(&[Characteristic::Ssid]).await.unwrap(),
            (Characteristic::Ssid, b"b".to_vec())
        );
        assert_eq!(
            queues.push(Characteristic::DeviceId, vec![]),
            Err(LinkError::NotWritable(Characteristic::DeviceId))
        );
    }

    #[tokio::test]
    async fn test_write_queues_keep_arrival_order_across_characteristics() {
        let queues = WriteQueues::new();
        queues.push(Characteristic::Password, b"p1".to_vec()).unwrap();
        queues.push(Characteristic::MessageOut, b"hi".to_vec()).unwrap();
        queues.push(Characteristic::Ssid, b"s".to_vec()).unwrap();
        queues.push(Characteristic::Password, b"p2".to_vec()).unwrap();

        let credentials = [Characteristic::Ssid, Characteristic::Password];
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(queues.recv(&credentials).await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                (Characteristic::Password, b"p1".to_vec()),
                (Characteristic::Ssid, b"s".to_vec()),
                (Characteristic::Password, b"p2".to_vec()),
            ]
        );
        // Writes to other characteristics stay queued for their own reader.
        assert_eq!(
            queues.recv(&[Characteristic::MessageOut]).await.unwrap(),
            (Characteristic::MessageOut, b"hi".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_queues_wake_waiting_reader() {
        let queues = std::sync::Arc::new(WriteQueues::new());
        let reader = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.recv(&[Characteristic::MessageOut]).await })
        };
        tokio::task::yield_now().await;
        queues.push(Characteristic::MessageOut, b"hi".to_vec()).unwrap();
        let (ch, data) = reader.await.unwrap().unwrap();
        assert_eq!((ch, data), (Characteristic::MessageOut, b"hi".to_vec()));
    }
}
