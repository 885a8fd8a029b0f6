//! Connectivity and control-plane supervisor for field sensor devices.
//!
//! A device keeps a WiFi uplink alive, exposes a BLE control service through
//! which a phone provisions credentials and exchanges messages, and mirrors
//! its link status back to the phone. All of it runs as cooperatively
//! cancelled tokio tasks under one supervisor.
//!
//! Everything except the radio drivers is platform-independent and tested on
//! the host with simulated radios and paused time.

pub mod config;
#[cfg(not(target_os = "espidf"))]
pub mod console;
pub mod control;
pub mod credentials;
pub mod device;
pub mod display;
pub mod identity;
pub mod sim;
pub mod status;
pub mod supervisor;
pub mod uplink;

pub use device::{Device, DeviceConfig, DeviceError};
pub use status::{StatusAggregator, StatusKey, StatusSnapshot, StatusUpdate};
pub use supervisor::{SupervisorError, TaskSupervisor};

#[cfg(test)]
mod tests {
    /// Sources that log; the logger already records the module as target.
    const LOGGING_SOURCES: &[(&str, &str)] = &[
        ("console.rs", include_str!("console.rs")),
        ("control/channel.rs", include_str!("control/channel.rs")),
        ("control/handlers.rs", include_str!("control/handlers.rs")),
        ("control/nimble.rs", include_str!("control/nimble.rs")),
        ("credentials/file_store.rs", include_str!("credentials/file_store.rs")),
        ("credentials/nvs_store.rs", include_str!("credentials/nvs_store.rs")),
        ("device.rs", include_str!("device.rs")),
        ("display.rs", include_str!("display.rs")),
        ("status.rs", include_str!("status.rs")),
        ("supervisor.rs", include_str!("supervisor.rs")),
        ("uplink/esp.rs", include_str!("uplink/esp.rs")),
        ("uplink/host.rs", include_str!("uplink/host.rs")),
        ("uplink/manager.rs", include_str!("uplink/manager.rs")),
    ];

    #[test]
    fn test_log_messages_carry_no_bracket_tags() {
        for (file, source) in LOGGING_SOURCES {
            for line in source.lines() {
                let tagged = line
                    .split("\"[")
                    .skip(1)
                    .any(|rest| rest.split_once("] ").is_some_and(|(tag, _)| {
                        !tag.is_empty() && tag.chars().all(|c| c.is_ascii_lowercase())
                    }));
                assert!(!tagged, "{}: tagged log message: {}", file, line.trim());
            }
        }
    }
}
