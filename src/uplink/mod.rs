//! Station-mode uplink.
//!
//! This module keeps the device associated with the provisioned access point:
//! - **[`machine`]**: pure reconnection state machine (host-testable)
//! - **[`UplinkManager`]**: async loop driving the machine over a radio
//! - **[`HostUplink`]**: host radio backed by the OS network stack
//! - **[`EspUplink`]**: ESP-IDF WiFi station driver (`esp32` feature)
//!
//! # Example
//!
//! ```no_run
//! use sensor_link::config::UplinkConfig;
//! use sensor_link::credentials::Credentials;
//! use sensor_link::status::StatusAggregator;
//! use sensor_link::uplink::{HostUplink, UplinkManager};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let status = Arc::new(StatusAggregator::new());
//! let uplink = UplinkManager::new(
//!     HostUplink::new(),
//!     Credentials::new("MyNetwork", "MyPassword"),
//!     status,
//!     UplinkConfig::default(),
//! );
//! uplink.run(CancellationToken::new()).await.unwrap();
//! # }
//! ```

mod host;
pub mod machine;
mod manager;

#[cfg(feature = "esp32")]
mod esp;

pub use host::HostUplink;
pub use machine::{Action, FailureOutcome, UplinkMachine, UplinkState};
pub use manager::UplinkManager;

#[cfg(feature = "esp32")]
pub use esp::EspUplink;

use crate::credentials::Credentials;
use std::net::IpAddr;

/// Station-mode radio driver.
///
/// All calls must return promptly: they run on the cooperative scheduler,
/// so a call that blocks stalls every other task.
pub trait UplinkRadio: Send {
    /// Start associating with `credentials`. Completion is observed through
    /// [`is_connected`](Self::is_connected).
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), UplinkError>;

    /// Drop any association and abort a connect still in progress.
    /// Calling this while idle is a no-op.
    fn disconnect(&mut self) -> Result<(), UplinkError>;

    /// Whether the station is associated and has an address.
    fn is_connected(&self) -> bool;

    /// Station address, if associated.
    fn ip_addr(&self) -> Option<IpAddr>;
}

/// Transient uplink failure.
#[derive(Debug)]
pub enum UplinkError {
    /// The driver rejected the SSID.
    InvalidSsid,
    /// The driver rejected the password.
    InvalidPassword,
    /// Driver or transport error.
    Radio(String),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for UplinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            Self::Radio(msg) => write!(f, "radio error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for UplinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for UplinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
