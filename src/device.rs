//! Device wiring.
//!
//! A [`Device`] owns one instance of every component and connects them
//! through their capabilities:
//!
//! ```text
//! ControlChannel ──ssid/password──▶ Provisioning ──▶ CredentialStore
//!       │                               │
//!       │ msg-out ──▶ MessageSink       └──CredentialSink──▶ UplinkManager
//!       │                                                        │
//!       └────────────StatusSink──▶ StatusAggregator ◀──StatusSink┘
//! ```
//!
//! The same wiring runs on the host (simulated or OS radios) and on the
//! ESP32 (NimBLE + ESP-IDF WiFi); only the radios and the store differ.

use crate::config::{ConfigError, ControlConfig, UplinkConfig, DISPLAY_INTERVAL};
use crate::control::{
    Characteristic, ControlChannel, ControlRadio, LinkError, MessageSink, Provisioning,
};
use crate::credentials::CredentialStore;
use crate::display::{self, StatusDisplay};
use crate::identity::DeviceIdentity;
use crate::status::StatusAggregator;
use crate::supervisor::TaskSupervisor;
use crate::uplink::{UplinkManager, UplinkRadio};
use log::info;
use std::fmt;
use std::sync::Arc;

/// Timing policy for every component.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConfig {
    pub uplink: UplinkConfig,
    pub control: ControlConfig,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.uplink.validate()?;
        self.control.validate()
    }
}

/// The connectivity and control plane of one device.
pub struct Device<U: UplinkRadio + 'static, C: ControlRadio> {
    identity: DeviceIdentity,
    status: Arc<StatusAggregator>,
    uplink: UplinkManager<U>,
    control: ControlChannel<C>,
    provisioning: Arc<Provisioning>,
    messages: Arc<dyn MessageSink>,
}

impl<U: UplinkRadio + 'static, C: ControlRadio> Device<U, C> {
    /// Wire the components. The uplink starts from the stored credentials.
    pub fn new(
        identity: DeviceIdentity,
        uplink_radio: U,
        control_radio: C,
        store: Box<dyn CredentialStore>,
        messages: Arc<dyn MessageSink>,
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        config.validate()?;

        let credentials = store.load();
        if credentials.is_empty() {
            info!("No uplink SSID stored, waiting for provisioning");
        } else {
            info!("Stored uplink SSID: {:?}", credentials.ssid());
        }

        let status = Arc::new(StatusAggregator::new());
        let uplink = UplinkManager::new(uplink_radio, credentials, status.clone(), config.uplink);
        let provisioning = Arc::new(Provisioning::new(store, Arc::new(uplink.clone())));
        let control =
            ControlChannel::new(control_radio, identity.clone(), status.clone(), config.control)?;

        Ok(Self {
            identity,
            status,
            uplink,
            control,
            provisioning,
            messages,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn status(&self) -> &Arc<StatusAggregator> {
        &self.status
    }

    pub fn uplink(&self) -> &UplinkManager<U> {
        &self.uplink
    }

    pub fn control(&self) -> &ControlChannel<C> {
        &self.control
    }

    pub fn provisioning(&self) -> &Arc<Provisioning> {
        &self.provisioning
    }

    /// Add the uplink loop, the advertise loop, the credential and message
    /// observers and the status mirror to `supervisor`.
    pub fn register(&self, supervisor: &mut TaskSupervisor) {
        let cancel = supervisor.cancel_token();

        let uplink = self.uplink.clone();
        let token = cancel.clone();
        supervisor.add("uplink", async move { uplink.run(token).await });

        let control = self.control.clone();
        let token = cancel.clone();
        supervisor.add("ble-advertise", async move { control.advertise_loop(token).await });

        let control = self.control.clone();
        let ssid = self.provisioning.clone();
        let password = self.provisioning.clone();
        let token = cancel.clone();
        supervisor.add("ble-credentials", async move {
            control
                .observe_credentials(
                    move |text: String| ssid.set_ssid(text),
                    move |text: String| password.set_password(text),
                    token,
                )
                .await
        });

        let control = self.control.clone();
        let messages = self.messages.clone();
        let token = cancel.clone();
        supervisor.add(format!("ble-observe-{}", Characteristic::MessageOut), async move {
            control
                .observe(
                    Characteristic::MessageOut,
                    move |text: String| messages.deliver(text),
                    token,
                )
                .await
        });

        let control = self.control.clone();
        let updates = self.status.subscribe();
        supervisor.add("ble-status", async move {
            control.mirror_status(updates, cancel).await
        });
    }

    /// Add the periodic status display to `supervisor`.
    pub fn register_display<D>(&self, supervisor: &mut TaskSupervisor, display: D)
    where
        D: StatusDisplay + 'static,
    {
        let identity = self.identity.clone();
        let updates = self.status.subscribe();
        let cancel = supervisor.cancel_token();
        supervisor.add(
            "display",
            display::render_loop(display, identity, updates, DISPLAY_INTERVAL, cancel),
        );
    }
}

/// Failure to assemble a [`Device`].
#[derive(Debug)]
pub enum DeviceError {
    Config(ConfigError),
    Link(LinkError),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Link(e) => write!(f, "control channel setup failed: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Link(e) => Some(e),
        }
    }
}

impl From<ConfigError> for DeviceError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<LinkError> for DeviceError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialStore, Credentials, FileStore, MemoryStore};
    use crate::identity::HOST_DEFAULT_MAC;
    use crate::sim::{SimControlRadio, SimUplink};
    use crate::status::StatusKey;
    use crate::supervisor::SupervisorError;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Inbox {
        messages: Mutex<Vec<String>>,
    }

    impl MessageSink for Inbox {
        fn deliver(&self, text: String) {
            self.messages.lock().unwrap().push(text);
        }
    }

    struct Running {
        device: Device<SimUplink, SimControlRadio>,
        uplink: SimUplink,
        radio: SimControlRadio,
        inbox: Arc<Inbox>,
        cancel: CancellationToken,
        supervisor: JoinHandle<Result<(), SupervisorError>>,
    }

    impl Running {
        fn start(store: Box<dyn CredentialStore>) -> Self {
            let uplink = SimUplink::with_access_point("HomeNet", "password123");
            let radio = SimControlRadio::new();
            let inbox = Arc::new(Inbox::default());
            let device = Device::new(
                DeviceIdentity::from_mac(&HOST_DEFAULT_MAC),
                uplink.clone(),
                radio.clone(),
                store,
                inbox.clone(),
                DeviceConfig::default(),
            )
            .unwrap();

            let cancel = CancellationToken::new();
            let mut supervisor = TaskSupervisor::new(cancel.clone());
            device.register(&mut supervisor);
            assert_eq!(supervisor.len(), 5);
            let supervisor = tokio::spawn(supervisor.run(cancel.clone().cancelled_owned()));

            Self {
                device,
                uplink,
                radio,
                inbox,
                cancel,
                supervisor,
            }
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.supervisor.await.unwrap().unwrap();
        }
    }

    fn wifi_up_notifications(radio: &SimControlRadio) -> usize {
        radio
            .notifications(Characteristic::ConnectionStatus)
            .iter()
            .filter(|value| String::from_utf8_lossy(value).contains(r#""wifi":true"#))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_boot_then_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let running = Running::start(Box::new(FileStore::open(&path)));

        // First boot: defaults document, nothing to associate with.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"wifi_ssid":"","wifi_pass":""}"#
        );
        sleep(Duration::from_secs(30)).await;
        assert_eq!(running.uplink.attempts(), 0);
        assert!(!running.device.status().get(StatusKey::Uplink));

        // A phone provisions the device.
        running.radio.connect_peer("phone");
        sleep(Duration::from_millis(10)).await;
        assert!(running.device.status().get(StatusKey::ControlChannel));

        running
            .radio
            .write(Characteristic::Ssid, b"HomeNet".to_vec())
            .unwrap();
        running
            .radio
            .write(Characteristic::Password, b"password123".to_vec())
            .unwrap();

        sleep(Duration::from_secs(15)).await;
        assert!(running.device.status().get(StatusKey::Uplink));
        assert!(running.device.uplink().is_connected());
        assert_eq!(wifi_up_notifications(&running.radio), 1);

        let stored: Credentials =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored, Credentials::new("HomeNet", "password123"));

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_credentials_connect_at_boot() {
        let store = MemoryStore::new(Credentials::new("HomeNet", "password123"));
        let running = Running::start(Box::new(store));

        sleep(Duration::from_secs(3)).await;
        assert!(running.device.status().get(StatusKey::Uplink));
        assert_eq!(running.uplink.attempts(), 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle() {
        let running = Running::start(Box::new(MemoryStore::default()));

        sleep(Duration::from_millis(10)).await;
        assert!(running.radio.is_advertising());
        assert_eq!(
            running.radio.advertisement().unwrap().name,
            running.device.identity().as_str()
        );

        running.radio.connect_peer("phone");
        sleep(Duration::from_millis(10)).await;
        assert!(running.device.status().get(StatusKey::ControlChannel));
        assert!(!running.radio.is_advertising());

        running.radio.disconnect_peer();
        sleep(Duration::from_millis(10)).await;
        assert!(!running.device.status().get(StatusKey::ControlChannel));

        sleep(Duration::from_millis(200)).await;
        assert!(running.radio.is_advertising());

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_message_reaches_sink() {
        let running = Running::start(Box::new(MemoryStore::default()));
        running.radio.connect_peer("phone");
        running
            .radio
            .write(Characteristic::MessageOut, b"hello device".to_vec())
            .unwrap();
        running
            .radio
            .write(Characteristic::MessageOut, vec![0xc3, 0x28])
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *running.inbox.messages.lock().unwrap(),
            vec!["hello device".to_string()]
        );
        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_registered_with_device() {
        let running = Running::start(Box::new(MemoryStore::default()));
        let cancel = CancellationToken::new();
        let mut supervisor = TaskSupervisor::new(cancel.clone());
        running
            .device
            .register_display(&mut supervisor, display::LogDisplay::new());
        assert_eq!(supervisor.len(), 1);

        cancel.cancel();
        supervisor
            .run(std::future::ready(()))
            .await
            .unwrap();
        running.stop().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DeviceConfig {
            uplink: UplinkConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = Device::new(
            DeviceIdentity::from_mac(&HOST_DEFAULT_MAC),
            SimUplink::new(),
            SimControlRadio::new(),
            Box::new(MemoryStore::default()),
            Arc::new(Inbox::default()),
            config,
        );
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }
}
