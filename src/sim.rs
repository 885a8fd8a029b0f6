//! In-memory radios.
//!
//! Both radios are cheap handles onto shared state: give one clone to the
//! component under test and keep another to script the environment (an
//! access point coming up, a phone connecting, a peer writing) and to observe
//! what the component did. The host binary drives [`SimControlRadio`] from
//! its console.

use crate::control::{
    Advertisement, Characteristic, ControlRadio, LinkError, PeerSession, WriteQueues,
};
use crate::credentials::Credentials;
use crate::uplink::{UplinkError, UplinkRadio};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// Address handed out by the simulated access point.
pub const SIM_STATION_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Station radio with a scriptable access point.
///
/// Association succeeds immediately when the credentials match the access
/// point exactly. Otherwise the connect stays pending, like a real driver
/// still scanning, and a second `begin_connect` is refused until
/// `disconnect` aborts it.
#[derive(Debug, Clone, Default)]
pub struct SimUplink {
    state: Arc<Mutex<SimUplinkState>>,
}

#[derive(Debug, Default)]
struct SimUplinkState {
    access_point: Option<Credentials>,
    associated: bool,
    connecting: bool,
    attempts: u32,
    rejected: u32,
    fail_next: Option<String>,
}

impl SimUplink {
    /// No access point in range.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_point(ssid: &str, password: &str) -> Self {
        let uplink = Self::new();
        uplink.set_access_point(Some(Credentials::new(ssid, password)));
        uplink
    }

    pub fn set_access_point(&self, access_point: Option<Credentials>) {
        lock(&self.state).access_point = access_point;
    }

    /// The access point drops the station.
    pub fn drop_link(&self) {
        lock(&self.state).associated = false;
    }

    /// Make the next `begin_connect` fail with a driver error.
    pub fn fail_next_connect(&self, message: &str) {
        lock(&self.state).fail_next = Some(message.to_string());
    }

    /// Number of `begin_connect` calls so far.
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    /// Number of `begin_connect` calls refused because a connect was pending.
    pub fn rejected_connects(&self) -> u32 {
        lock(&self.state).rejected
    }

    /// A connect was issued and has neither associated nor been aborted.
    pub fn is_connecting(&self) -> bool {
        lock(&self.state).connecting
    }
}

impl UplinkRadio for SimUplink {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), UplinkError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.connecting {
            state.rejected += 1;
            return Err(UplinkError::Radio("connect already in progress".into()));
        }
        if let Some(message) = state.fail_next.take() {
            return Err(UplinkError::Radio(message));
        }
        state.associated = state.access_point.as_ref() == Some(credentials);
        state.connecting = !state.associated;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), UplinkError> {
        let mut state = lock(&self.state);
        state.associated = false;
        state.connecting = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).associated
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        lock(&self.state).associated.then_some(SIM_STATION_IP)
    }
}

/// GATT server with a scriptable peer.
#[derive(Clone)]
pub struct SimControlRadio {
    shared: Arc<SimRadioShared>,
}

struct SimRadioShared {
    state: Mutex<SimRadioState>,
    writes: WriteQueues,
    peers_tx: mpsc::UnboundedSender<SimPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimPeer>>,
}

#[derive(Default)]
struct SimRadioState {
    advertisement: Option<Advertisement>,
    advertise_count: u32,
    fail_next_advertise: Option<String>,
    values: HashMap<Characteristic, Vec<u8>>,
    notifications: Vec<(Characteristic, Vec<u8>)>,
    /// Link to the connected peer; sending `true` drops it.
    peer: Option<watch::Sender<bool>>,
    sessions_closed: u32,
}

impl SimControlRadio {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(SimRadioShared {
                state: Mutex::new(SimRadioState::default()),
                writes: WriteQueues::new(),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimRadioState> {
        lock(&self.shared.state)
    }

    /// A peer named `name` connects.
    pub fn connect_peer(&self, name: &str) {
        let (tx, gone) = watch::channel(false);
        self.state().peer = Some(tx);
        let peer = SimPeer {
            name: name.to_string(),
            gone,
            shared: Arc::clone(&self.shared),
            closed: false,
        };
        // The receiver lives as long as the radio.
        let _ = self.shared.peers_tx.send(peer);
    }

    /// The connected peer goes away. Returns `false` if none was connected.
    pub fn disconnect_peer(&self) -> bool {
        match self.state().peer.take() {
            Some(link) => {
                let _ = link.send(true);
                true
            }
            None => false,
        }
    }

    pub fn is_peer_connected(&self) -> bool {
        self.state().peer.is_some()
    }

    /// The peer writes `data` to `characteristic`.
    pub fn write(&self, characteristic: Characteristic, data: Vec<u8>) -> Result<(), LinkError> {
        self.shared.writes.push(characteristic, data)
    }

    /// Current value of `characteristic`.
    pub fn value(&self, characteristic: Characteristic) -> Option<Vec<u8>> {
        self.state().values.get(&characteristic).cloned()
    }

    pub fn value_text(&self, characteristic: Characteristic) -> Option<String> {
        self.value(characteristic)
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    /// Every value pushed to `characteristic`, oldest first.
    pub fn notifications(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.state()
            .notifications
            .iter()
            .filter(|(ch, _)| *ch == characteristic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn is_advertising(&self) -> bool {
        self.state().advertisement.is_some()
    }

    pub fn advertisement(&self) -> Option<Advertisement> {
        self.state().advertisement.clone()
    }

    /// Number of times advertising was started.
    pub fn advertise_count(&self) -> u32 {
        self.state().advertise_count
    }

    /// Number of sessions closed from the device side.
    pub fn sessions_closed(&self) -> u32 {
        self.state().sessions_closed
    }

    pub fn fail_next_advertise(&self, message: &str) {
        self.state().fail_next_advertise = Some(message.to_string());
    }
}

impl Default for SimControlRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlRadio for SimControlRadio {
    type Session = SimPeer;

    fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), LinkError> {
        let mut state = self.state();
        if let Some(message) = state.fail_next_advertise.take() {
            return Err(LinkError::Stack(message));
        }
        state.advertisement = Some(advertisement.clone());
        state.advertise_count += 1;
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), LinkError> {
        self.state().advertisement = None;
        Ok(())
    }

    fn accept(&self) -> impl Future<Output = Result<SimPeer, LinkError>> + Send {
        async move {
            let mut peers = self.shared.peers_rx.lock().await;
            peers.recv().await.ok_or(LinkError::Closed)
        }
    }

    fn written(
        &self,
        characteristics: &[Characteristic],
    ) -> impl Future<Output = Result<(Characteristic, Vec<u8>), LinkError>> + Send {
        self.shared.writes.recv(characteristics)
    }

    fn set_value(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state();
        state.values.insert(characteristic, value.to_vec());
        state.notifications.push((characteristic, value.to_vec()));
        Ok(())
    }
}

/// Session with a simulated peer.
pub struct SimPeer {
    name: String,
    gone: watch::Receiver<bool>,
    shared: Arc<SimRadioShared>,
    closed: bool,
}

impl PeerSession for SimPeer {
    fn peer(&self) -> String {
        self.name.clone()
    }

    fn disconnected(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            loop {
                let gone = *self.gone.borrow_and_update();
                if gone || self.gone.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.shared.state);
        state.peer = None;
        state.sessions_closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uplink_associates_only_with_matching_credentials() {
        let mut uplink = SimUplink::with_access_point("HomeNet", "password123");
        uplink
            .begin_connect(&Credentials::new("HomeNet", "wrong-password"))
            .unwrap();
        assert!(!uplink.is_connected());
        uplink.disconnect().unwrap();

        uplink
            .begin_connect(&Credentials::new("HomeNet", "password123"))
            .unwrap();
        assert!(uplink.is_connected());
        assert_eq!(uplink.ip_addr(), Some(SIM_STATION_IP));
        assert_eq!(uplink.attempts(), 2);
    }

    #[test]
    fn test_uplink_scripted_failure() {
        let mut uplink = SimUplink::with_access_point("HomeNet", "password123");
        uplink.fail_next_connect("boom");
        let creds = Credentials::new("HomeNet", "password123");
        assert!(uplink.begin_connect(&creds).is_err());
        assert!(uplink.begin_connect(&creds).is_ok());
    }

    #[test]
    fn test_uplink_pending_connect_must_be_aborted() {
        let mut uplink = SimUplink::new();
        let creds = Credentials::new("HomeNet", "password123");
        uplink.begin_connect(&creds).unwrap();
        assert!(uplink.is_connecting());

        assert!(uplink.begin_connect(&creds).is_err());
        assert_eq!(uplink.rejected_connects(), 1);

        uplink.disconnect().unwrap();
        assert!(!uplink.is_connecting());
        assert!(uplink.begin_connect(&creds).is_ok());
        assert_eq!(uplink.rejected_connects(), 1);
    }

    #[tokio::test]
    async fn test_peer_session() {
        let radio = SimControlRadio::new();
        radio.connect_peer("phone");
        let mut session = radio.accept().await.unwrap();
        assert_eq!(session.peer(), "phone");
        assert!(radio.is_peer_connected());

        assert!(radio.disconnect_peer());
        session.disconnected().await;
        session.close();
        session.close();
        assert_eq!(radio.sessions_closed(), 1);
        assert!(!radio.disconnect_peer());
    }
}
