//! Periodic status display.
//!
//! Renders the device identity and the four link flags on a small text
//! display:
//!
//! ```text
//! ID:246F28ABCDEF
//! ----------------
//! ----------------
//! Wifi:OK | BLE: ?
//! MQTT: ? | NET:OK
//! ```

use crate::identity::DeviceIdentity;
use crate::status::StatusSnapshot;
use crate::supervisor::TaskError;
use log::{info, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const SEPARATOR: &str = "----------------";

/// A text display.
pub trait StatusDisplay: Send {
    /// Replace the display contents with `lines`.
    fn render(&mut self, lines: &[String]) -> Result<(), DisplayError>;
}

/// Display driver failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayError(pub String);

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display error: {}", self.0)
    }
}

impl std::error::Error for DisplayError {}

fn flag(up: bool) -> &'static str {
    if up {
        "OK"
    } else {
        " ?"
    }
}

/// Lines shown for `snapshot`.
pub fn format_lines(identity: &DeviceIdentity, snapshot: &StatusSnapshot) -> Vec<String> {
    vec![
        format!("ID:{}", identity),
        SEPARATOR.to_string(),
        SEPARATOR.to_string(),
        format!(
            "Wifi:{} | BLE:{}",
            flag(snapshot.uplink_up),
            flag(snapshot.control_channel_up)
        ),
        format!(
            "MQTT:{} | NET:{}",
            flag(snapshot.relay_up),
            flag(snapshot.cloud_up)
        ),
    ]
}

/// Redraw `display` every `interval` until cancelled. Render errors are
/// logged and the next refresh happens as usual.
pub async fn render_loop<D: StatusDisplay>(
    mut display: D,
    identity: DeviceIdentity,
    status: watch::Receiver<StatusSnapshot>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), TaskError> {
    loop {
        let snapshot = *status.borrow();
        if let Err(e) = display.render(&format_lines(&identity, &snapshot)) {
            warn!("{}", e);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Display task cancelled");
    Ok(())
}

/// Display that writes to the log whenever the contents change.
#[derive(Debug, Default)]
pub struct LogDisplay {
    last: Vec<String>,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusDisplay for LogDisplay {
    fn render(&mut self, lines: &[String]) -> Result<(), DisplayError> {
        if self.last != lines {
            let shown: Vec<&str> = lines
                .iter()
                .map(String::as_str)
                .filter(|line| *line != SEPARATOR)
                .collect();
            info!("{}", shown.join(" | "));
            self.last = lines.to_vec();
        }
        Ok(())
    }
}
