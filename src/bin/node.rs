//! Sensor link node binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin node`
//! - **ESP32**: `cargo espflash flash --bin node --features esp32 --release`
//!
//! On the host the control channel is simulated: type `help` at the prompt
//! to act as the phone. The credential document lives at
//! `$NODE_CONFIG_PATH` (default `~/.sensor-link/config.json`).

use log::{error, info};
use sensor_link::device::{Device, DeviceConfig};
use sensor_link::supervisor::TaskSupervisor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Log a startup failure and exit.
fn fatal(msg: &str, e: &dyn std::fmt::Display) -> ! {
    error!("{}: {}", msg, e);
    std::process::exit(1);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Sensor link node starting ===");

    let cancel = CancellationToken::new();
    let mut supervisor = TaskSupervisor::new(cancel.clone());

    #[cfg(not(feature = "esp32"))]
    let shutdown = host_setup(&mut supervisor);

    #[cfg(feature = "esp32")]
    let shutdown = esp32_setup(&mut supervisor);

    if let Err(e) = supervisor.run(shutdown).await {
        error!("Node stopped: {}", e);
        std::process::exit(1);
    }
    info!("Node stopped");
}

#[cfg(not(feature = "esp32"))]
fn host_setup(supervisor: &mut TaskSupervisor) -> impl std::future::Future<Output = ()> {
    use sensor_link::config::HostSettings;
    use sensor_link::console::{stdin_lines, Console};
    use sensor_link::control::LogMessageSink;
    use sensor_link::credentials::FileStore;
    use sensor_link::display::LogDisplay;
    use sensor_link::identity::{DeviceIdentity, HOST_DEFAULT_MAC};
    use sensor_link::sim::SimControlRadio;
    use sensor_link::uplink::HostUplink;

    info!("Platform: Host");

    let settings = HostSettings::from_env().unwrap_or_else(|e| fatal("Bad settings", &e));
    let identity = DeviceIdentity::from_mac(&settings.mac.unwrap_or(HOST_DEFAULT_MAC));
    info!("Device identity: {}", identity);

    let config = DeviceConfig {
        uplink: settings.uplink,
        ..Default::default()
    };
    let device = Device::new(
        identity,
        HostUplink::new(),
        SimControlRadio::new(),
        Box::new(FileStore::open(&settings.config_path)),
        Arc::new(LogMessageSink),
        config,
    )
    .unwrap_or_else(|e| fatal("Failed to set up device", &e));

    device.register(supervisor);
    device.register_display(supervisor, LogDisplay::new());

    let console = Console::new(
        device.control().clone(),
        device.status().clone(),
        device.uplink().clone(),
    );
    let token = supervisor.cancel_token();
    let input = stdin_lines();
    supervisor.add("console", async move { console.run(input, token).await });

    async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    }
}

#[cfg(feature = "esp32")]
fn esp32_setup(supervisor: &mut TaskSupervisor) -> impl std::future::Future<Output = ()> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use sensor_link::control::{LogMessageSink, NimbleRadio};
    use sensor_link::credentials::NvsStore;
    use sensor_link::display::LogDisplay;
    use sensor_link::identity::{read_mac, DeviceIdentity};
    use sensor_link::uplink::EspUplink;

    info!("Platform: ESP32");

    let peripherals = Peripherals::take().unwrap_or_else(|e| fatal("No peripherals", &e));
    let sysloop = EspSystemEventLoop::take().unwrap_or_else(|e| fatal("No event loop", &e));
    let nvs = EspDefaultNvsPartition::take().unwrap_or_else(|e| fatal("No NVS partition", &e));

    let identity = DeviceIdentity::from_mac(&read_mac());
    info!("Device identity: {}", identity);

    let store = NvsStore::open(nvs.clone()).unwrap_or_else(|e| fatal("NVS unavailable", &e));
    let uplink = EspUplink::new(peripherals.modem, sysloop, Some(nvs))
        .unwrap_or_else(|e| fatal("WiFi unavailable", &e));
    let control = NimbleRadio::new().unwrap_or_else(|e| fatal("BLE unavailable", &e));

    let device = Device::new(
        identity,
        uplink,
        control,
        Box::new(store),
        Arc::new(LogMessageSink),
        DeviceConfig::default(),
    )
    .unwrap_or_else(|e| fatal("Failed to set up device", &e));

    device.register(supervisor);
    device.register_display(supervisor, LogDisplay::new());

    // Runs until a task fails.
    std::future::pending()
}
