//! NimBLE GATT server for the control service.

use super::{
    Advertisement, Characteristic, ControlRadio, LinkError, PeerSession, Properties, WriteQueues,
    SERVICE_UUID,
};
use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLECharacteristic, BLEDevice, BLEError, NimbleProperties};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

/// Advertising interval unit (0.625 ms) in microseconds.
const ADV_UNIT_US: u128 = 625;

/// Control service hosted on the ESP32 NimBLE stack.
///
/// NimBLE callbacks run on the host task; they only push into channels that
/// the async side drains.
pub struct NimbleRadio {
    characteristics: HashMap<Characteristic, Arc<NimbleMutex<BLECharacteristic>>>,
    writes: Arc<WriteQueues>,
    peers: Mutex<mpsc::UnboundedReceiver<(u16, String)>>,
    connection: watch::Receiver<Option<u16>>,
}

impl NimbleRadio {
    /// Register the control service on the NimBLE server.
    pub fn new() -> Result<Self, LinkError> {
        let device = BLEDevice::take();
        let server = device.get_server();
        server.advertise_on_disconnect(false);

        let (peers_tx, peers) = mpsc::unbounded_channel();
        let (connection_tx, connection) = watch::channel(None);
        let connection_tx = Arc::new(connection_tx);

        let on_connect = connection_tx.clone();
        server.on_connect(move |_server, desc| {
            let handle = desc.conn_handle();
            info!("Peer connected: {:?}", desc.address());
            on_connect.send_replace(Some(handle));
            if peers_tx.send((handle, format!("{:?}", desc.address()))).is_err() {
                warn!("Connection dropped: channel closed");
            }
        });
        server.on_disconnect(move |desc, reason| {
            info!("Peer disconnected: {:?} ({:?})", desc.address(), reason);
            connection_tx.send_replace(None);
        });

        let service = server.create_service(ble_uuid(SERVICE_UUID));
        let writes = Arc::new(WriteQueues::new());
        let mut characteristics = HashMap::new();

        for ch in Characteristic::ALL {
            let characteristic = service
                .lock()
                .create_characteristic(ble_uuid(ch.uuid()), nimble_properties(ch.properties()));

            if ch.is_writable() {
                let writes = writes.clone();
                characteristic.lock().on_write(move |args| {
                    let data = args.recv_data();
                    if ch.max_len().is_some_and(|max| data.len() > max) {
                        warn!("Rejected oversized {} write: {} bytes", ch, data.len());
                        return;
                    }
                    if let Err(e) = writes.push(ch, data.to_vec()) {
                        warn!("Write to {} dropped: {}", ch, e);
                    }
                });
            }
            characteristics.insert(ch, characteristic);
        }

        debug!("Control service registered");
        Ok(Self {
            characteristics,
            writes,
            peers: Mutex::new(peers),
            connection,
        })
    }
}

impl ControlRadio for NimbleRadio {
    type Session = NimblePeer;

    fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), LinkError> {
        let units = (advertisement.interval.as_micros() / ADV_UNIT_US).clamp(0x20, 0x4000) as u16;
        let advertising = BLEDevice::take().get_advertising();
        let mut advertising = advertising.lock();
        advertising
            .set_data(
                BLEAdvertisementData::new()
                    .name(&advertisement.name)
                    .add_service_uuid(ble_uuid(advertisement.service)),
            )
            .map_err(stack_error)?;
        advertising.min_interval(units).max_interval(units);
        advertising.start().map_err(stack_error)
    }

    fn stop_advertising(&self) -> Result<(), LinkError> {
        BLEDevice::take()
            .get_advertising()
            .lock()
            .stop()
            .map_err(stack_error)
    }

    fn accept(&self) -> impl Future<Output = Result<NimblePeer, LinkError>> + Send {
        async move {
            let (handle, address) = self
                .peers
                .lock()
                .await
                .recv()
                .await
                .ok_or(LinkError::Closed)?;
            Ok(NimblePeer {
                handle,
                address,
                connection: self.connection.clone(),
                closed: false,
            })
        }
    }

    fn written(
        &self,
        characteristics: &[Characteristic],
    ) -> impl Future<Output = Result<(Characteristic, Vec<u8>), LinkError>> + Send {
        self.writes.recv(characteristics)
    }

    fn set_value(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), LinkError> {
        let handle = self
            .characteristics
            .get(&characteristic)
            .ok_or(LinkError::Closed)?;
        handle.lock().set_value(value).notify();
        Ok(())
    }
}

/// A phone connected over NimBLE.
pub struct NimblePeer {
    handle: u16,
    address: String,
    connection: watch::Receiver<Option<u16>>,
    closed: bool,
}

impl PeerSession for NimblePeer {
    fn peer(&self) -> String {
        self.address.clone()
    }

    fn disconnected(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            loop {
                if *self.connection.borrow_and_update() != Some(self.handle) {
                    break;
                }
                if self.connection.changed().await.is_err() {
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
        if *self.connection.borrow() != Some(self.handle) {
            return;
        }
        if let Err(e) = BLEDevice::take().get_server().disconnect(self.handle) {
            warn!("Failed to disconnect {}: {:?}", self.address, e);
        }
    }
}

/// NimBLE stores 128-bit UUIDs little-endian.
fn ble_uuid(uuid: Uuid) -> BleUuid {
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    BleUuid::from_uuid128(bytes)
}

fn nimble_properties(properties: Properties) -> NimbleProperties {
    let mut flags = NimbleProperties::empty();
    if properties.contains(Properties::READ) {
        flags |= NimbleProperties::READ;
    }
    if properties.contains(Properties::WRITE) {
        flags |= NimbleProperties::WRITE;
    }
    if properties.contains(Properties::NOTIFY) {
        flags |= NimbleProperties::NOTIFY;
    }
    if properties.contains(Properties::INDICATE) {
        flags |= NimbleProperties::INDICATE;
    }
    flags
}

fn stack_error(e: BLEError) -> LinkError {
    LinkError::Stack(format!("{:?}", e))
}
