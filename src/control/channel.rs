//! Control channel loops.

use super::{
    decode_text, Advertisement, Characteristic, ControlRadio, LinkError, PeerSession,
    WriteHandler, SERVICE_UUID,
};
use crate::config::ControlConfig;
use crate::identity::DeviceIdentity;
use crate::status::{StatusSink, StatusSnapshot, StatusUpdate};
use crate::supervisor::TaskError;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// BLE control channel over a [`ControlRadio`].
///
/// Cheap to clone; each loop runs as its own task on a clone.
pub struct ControlChannel<R: ControlRadio> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    radio: R,
    identity: DeviceIdentity,
    status: Arc<dyn StatusSink>,
    config: ControlConfig,
}

impl<R: ControlRadio> Clone for ControlChannel<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: ControlRadio> ControlChannel<R> {
    /// Register initial characteristic values.
    pub fn new(
        radio: R,
        identity: DeviceIdentity,
        status: Arc<dyn StatusSink>,
        config: ControlConfig,
    ) -> Result<Self, LinkError> {
        radio.set_value(Characteristic::Ssid, b"")?;
        radio.set_value(Characteristic::Password, b"")?;
        radio.set_value(Characteristic::MessageIn, b"")?;
        radio.set_value(Characteristic::DeviceId, identity.as_bytes())?;

        Ok(Self {
            shared: Arc::new(Shared {
                radio,
                identity,
                status,
                config,
            }),
        })
    }

    pub fn radio(&self) -> &R {
        &self.shared.radio
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            name: self.shared.identity.to_string(),
            service: SERVICE_UUID,
            interval: self.shared.config.advertising_interval,
        }
    }

    /// Advertise, serve one peer at a time, repeat until cancelled.
    ///
    /// Errors are logged and the cycle restarts after a short pause.
    pub async fn advertise_loop(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        info!("BLE advertising as {}", self.shared.identity);

        loop {
            // Dropping `serve_one` releases whatever it holds.
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.serve_one() => result,
            };
            if let Err(e) = result {
                warn!("Control channel error: {}", e);
            }

            if !pause(self.shared.config.error_pause, &cancel).await {
                break;
            }
        }

        info!("BLE advertising terminated");
        Ok(())
    }

    async fn serve_one(&self) -> Result<(), LinkError> {
        let radio = &self.shared.radio;
        let advertising = AdvertisingGuard::start(radio, &self.advertisement())?;
        let session = radio.accept().await?;
        drop(advertising);

        let mut session = SessionGuard::open(session, self.shared.status.as_ref());
        session.disconnected().await;
        Ok(())
    }

    /// Deliver every write to `characteristic` to `handler` until cancelled.
    ///
    /// Empty writes are ignored. Payloads that are not text within the
    /// characteristic's length bound are logged and dropped.
    pub async fn observe(
        &self,
        characteristic: Characteristic,
        handler: impl WriteHandler,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        self.observe_writes(&[characteristic], |_, text| handler.handle(text), cancel)
            .await
    }

    /// Observe the SSID and password characteristics from one loop.
    ///
    /// Writes reach the handlers in the order the peer made them, so a
    /// password written right after an SSID is applied after the SSID
    /// cleared the old one.
    pub async fn observe_credentials(
        &self,
        ssid: impl WriteHandler,
        password: impl WriteHandler,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        self.observe_writes(
            &[Characteristic::Ssid, Characteristic::Password],
            |characteristic, text| match characteristic {
                Characteristic::Ssid => ssid.handle(text),
                _ => password.handle(text),
            },
            cancel,
        )
        .await
    }

    async fn observe_writes(
        &self,
        characteristics: &[Characteristic],
        dispatch: impl Fn(Characteristic, String) + Send + Sync,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        if let Some(&ch) = characteristics.iter().find(|ch| !ch.is_writable()) {
            return Err(Box::new(LinkError::NotWritable(ch)));
        }
        debug!("Observing {:?}", characteristics);

        loop {
            let written = tokio::select! {
                _ = cancel.cancelled() => break,
                written = self.shared.radio.written(characteristics) => written,
            };

            match written {
                Ok((characteristic, data)) if data.is_empty() => {
                    debug!("Ignoring empty write to {}", characteristic)
                }
                Ok((characteristic, data)) => match decode_text(characteristic, &data) {
                    Ok(text) => {
                        debug!("{} written ({} bytes)", characteristic, text.len());
                        dispatch(characteristic, text);
                    }
                    Err(e) => warn!("Dropped write to {}: {}", characteristic, e),
                },
                Err(e) => {
                    warn!("Error observing {:?}: {}", characteristics, e);
                    if !pause(self.shared.config.error_pause, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!("Observer for {:?} cancelled", characteristics);
        Ok(())
    }

    /// Mirror the status register into the connection-status characteristic.
    pub async fn mirror_status(
        &self,
        mut status: watch::Receiver<StatusSnapshot>,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        loop {
            let snapshot = *status.borrow_and_update();
            let value = snapshot.to_ble_string();
            if let Err(e) = self
                .shared
                .radio
                .set_value(Characteristic::ConnectionStatus, value.as_bytes())
            {
                warn!("Failed to update status characteristic: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        debug!("Status register closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a device-to-peer message.
    pub fn send_message(&self, text: &str) -> Result<(), LinkError> {
        self.shared
            .radio
            .set_value(Characteristic::MessageIn, text.as_bytes())?;
        debug!("Message sent ({} bytes)", text.len());
        Ok(())
    }
}

/// Stops advertising when dropped.
struct AdvertisingGuard<'a, R: ControlRadio> {
    radio: &'a R,
}

impl<'a, R: ControlRadio> AdvertisingGuard<'a, R> {
    fn start(radio: &'a R, advertisement: &Advertisement) -> Result<Self, LinkError> {
        radio.start_advertising(advertisement)?;
        debug!("Advertising started");
        Ok(Self { radio })
    }
}

impl<R: ControlRadio> Drop for AdvertisingGuard<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.radio.stop_advertising() {
            warn!("Failed to stop advertising: {}", e);
        }
    }
}

/// A connected peer. Reports the channel up on open; closes the session and
/// reports it down when dropped.
struct SessionGuard<'a, S: PeerSession> {
    session: S,
    status: &'a dyn StatusSink,
}

impl<'a, S: PeerSession> SessionGuard<'a, S> {
    fn open(session: S, status: &'a dyn StatusSink) -> Self {
        info!("BLE client {} connected", session.peer());
        status.publish(StatusUpdate::new().control_channel(true));
        Self { session, status }
    }

    async fn disconnected(&mut self) {
        self.session.disconnected().await;
    }
}

impl<S: PeerSession> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        self.session.close();
        info!("BLE client {} disconnected", self.session.peer());
        self.status
            .publish(StatusUpdate::new().control_channel(false));
    }
}

/// Returns `false` if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
