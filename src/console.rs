//! Line console for host builds.
//!
//! Stands in for the phone: typed commands drive the simulated control radio
//! the same way a BLE peer would.
//!
//! # Commands
//!
//! - `connect [name]` - A peer connects to the control channel
//! - `disconnect` - The peer disconnects
//! - `ssid <name>` - Peer writes the uplink SSID (clears the password)
//! - `password <pass>` - Peer writes the uplink password
//! - `msg <text>` - Peer sends a message to the device
//! - `send <text>` - Device sends a message to the peer
//! - `status` - Show link status
//! - `help` - Show available commands
//!
//! # Example Session
//!
//! ```text
//! > connect
//! Peer "phone" connected
//! > ssid HomeNet
//! > password hunter2hunter2
//! > status
//! ID: 020000000001  BLE: up  WiFi: up (192.168.1.20) [connected, 0 failures]  Online: down  MQTT: down
//! ```

use crate::control::{Characteristic, ControlChannel};
use crate::sim::SimControlRadio;
use crate::status::StatusAggregator;
use crate::supervisor::TaskError;
use crate::uplink::{UplinkManager, UplinkRadio};
use log::{debug, info, warn};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Peer name used when `connect` is given none.
const DEFAULT_PEER: &str = "phone";

/// Parsed console command.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect { peer: String },
    Disconnect,
    Ssid(String),
    Password(String),
    /// Peer to device.
    Message(String),
    /// Device to peer.
    Send(String),
    Status,
    Help,
    /// Unknown or invalid command.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Self::Unknown(String::new());
        }

        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        let required = |usage: &str, build: fn(String) -> Self| {
            if args.is_empty() {
                Self::Unknown(format!("Usage: {}", usage))
            } else {
                build(args.to_string())
            }
        };

        match cmd.to_lowercase().as_str() {
            "connect" | "c" => Self::Connect {
                peer: if args.is_empty() {
                    DEFAULT_PEER.to_string()
                } else {
                    args.to_string()
                },
            },
            "disconnect" | "dc" => Self::Disconnect,
            "ssid" => required("ssid <name>", Self::Ssid),
            "password" | "pass" => required("password <pass>", Self::Password),
            "msg" | "m" => required("msg <text>", Self::Message),
            "send" => required("send <text>", Self::Send),
            "status" | "s" => Self::Status,
            "help" | "h" | "?" => Self::Help,
            _ => Self::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }
}

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  connect [name]     A peer connects over BLE
  disconnect         The peer disconnects
  ssid <name>        Peer writes the WiFi SSID (clears the password)
  password <pass>    Peer writes the WiFi password
  msg <text>         Peer sends a message to the device
  send <text>        Device sends a message to the peer
  status             Show link status
  help               Show this help

Shortcuts: c=connect, dc=disconnect, m=msg, s=status, h=help
"#;

/// Executes console commands against the simulated control radio.
pub struct Console<U: UplinkRadio + 'static> {
    radio: SimControlRadio,
    channel: ControlChannel<SimControlRadio>,
    status: Arc<StatusAggregator>,
    uplink: UplinkManager<U>,
}

impl<U: UplinkRadio + 'static> Console<U> {
    pub fn new(
        channel: ControlChannel<SimControlRadio>,
        status: Arc<StatusAggregator>,
        uplink: UplinkManager<U>,
    ) -> Self {
        Self {
            radio: channel.radio().clone(),
            channel,
            status,
            uplink,
        }
    }

    /// Run one command and return the text to show, if any.
    pub fn execute(&self, command: ConsoleCommand) -> Option<String> {
        match command {
            ConsoleCommand::Connect { peer } => {
                if self.radio.is_peer_connected() {
                    return Some("A peer is already connected".to_string());
                }
                self.radio.connect_peer(&peer);
                Some(format!("Peer {:?} connected", peer))
            }
            ConsoleCommand::Disconnect => {
                if self.radio.disconnect_peer() {
                    Some("Peer disconnected".to_string())
                } else {
                    Some("No peer connected".to_string())
                }
            }
            ConsoleCommand::Ssid(value) => self.peer_write(Characteristic::Ssid, value),
            ConsoleCommand::Password(value) => self.peer_write(Characteristic::Password, value),
            ConsoleCommand::Message(value) => self.peer_write(Characteristic::MessageOut, value),
            ConsoleCommand::Send(text) => match self.channel.send_message(&text) {
                Ok(()) => Some(format!("Sent {} bytes", text.len())),
                Err(e) => Some(format!("Send failed: {}", e)),
            },
            ConsoleCommand::Status => Some(self.format_status()),
            ConsoleCommand::Help => Some(HELP_TEXT.to_string()),
            ConsoleCommand::Unknown(msg) if msg.is_empty() => None,
            ConsoleCommand::Unknown(msg) => Some(msg),
        }
    }

    fn peer_write(&self, characteristic: Characteristic, value: String) -> Option<String> {
        if !self.radio.is_peer_connected() {
            return Some("No peer connected. Type 'connect' first.".to_string());
        }
        match self.radio.write(characteristic, value.into_bytes()) {
            Ok(()) => None,
            Err(e) => Some(format!("Write failed: {}", e)),
        }
    }

    fn format_status(&self) -> String {
        let snapshot = self.status.snapshot();
        let updown = |up: bool| if up { "up" } else { "down" };
        let wifi = match self.uplink.address() {
            Some(ip) => format!("up ({})", ip),
            None => updown(snapshot.uplink_up).to_string(),
        };
        format!(
            "ID: {}  BLE: {}  WiFi: {} [{}, {} failures]  Online: {}  MQTT: {}",
            self.channel.identity(),
            updown(snapshot.control_channel_up),
            wifi,
            self.uplink.state(),
            self.uplink.failure_count(),
            updown(snapshot.cloud_up),
            updown(snapshot.relay_up),
        )
    }

    /// Execute lines from `input` until it closes or the task is cancelled.
    pub async fn run(
        &self,
        mut input: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        info!("Console ready. Type 'help' for commands.");
        loop {
            print_prompt();
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = input.recv() => line,
            };
            let Some(line) = line else {
                debug!("Console input closed");
                break;
            };
            if let Some(output) = self.execute(ConsoleCommand::parse(&line)) {
                println!("{}", output);
            }
        }
        Ok(())
    }
}

/// Forward stdin lines from a dedicated thread.
///
/// A blocking stdin read cannot be interrupted, so it stays off the runtime
/// and the thread is abandoned at exit.
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Console input error: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start console reader: {}", e);
    }
    rx
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
