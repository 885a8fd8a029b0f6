//! Capabilities invoked when a peer writes a characteristic.

use crate::credentials::{CredentialField, CredentialSink, CredentialStore, Credentials};
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zeroize::Zeroize;

/// Receives decoded text written to one characteristic.
///
/// Called synchronously from the observer loop, so it must not block.
pub trait WriteHandler: Send + Sync {
    fn handle(&self, text: String);
}

impl<F> WriteHandler for F
where
    F: Fn(String) + Send + Sync,
{
    fn handle(&self, text: String) {
        self(text)
    }
}

/// Destination for peer-to-device messages.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, text: String);
}

/// Message sink that only logs.
#[derive(Debug, Default)]
pub struct LogMessageSink;

impl MessageSink for LogMessageSink {
    fn deliver(&self, text: String) {
        info!("New message: {}", text);
    }
}

/// Applies provisioning writes: persist the field, then hand the whole
/// credential pair to the uplink.
pub struct Provisioning {
    store: Mutex<Box<dyn CredentialStore>>,
    uplink: Arc<dyn CredentialSink>,
}

impl Provisioning {
    pub fn new(store: Box<dyn CredentialStore>, uplink: Arc<dyn CredentialSink>) -> Self {
        Self {
            store: Mutex::new(store),
            uplink,
        }
    }

    /// New SSID. The stored password is cleared in the same update.
    pub fn set_ssid(&self, ssid: String) {
        let credentials = self.write(CredentialField::Ssid, &ssid);
        self.uplink.apply(credentials);
        info!("Uplink SSID updated to {:?}", ssid);
    }

    pub fn set_password(&self, mut password: String) {
        let credentials = self.write(CredentialField::Password, &password);
        password.zeroize();
        self.uplink.apply(credentials);
        info!("Uplink password updated");
    }

    /// Current stored credentials.
    pub fn credentials(&self) -> Credentials {
        self.lock().load()
    }

    /// Persist one field. A failed write is logged and the in-memory value
    /// is used regardless.
    fn write(&self, field: CredentialField, value: &str) -> Credentials {
        let mut store = self.lock();
        if let Err(e) = store.set(field, value) {
            warn!("Failed to persist {}: {}", field.key(), e);
        }
        store.load()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn CredentialStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
