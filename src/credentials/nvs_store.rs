//! NVS persistence for uplink credentials.
//!
//! Stores the JSON credential document as a single blob in ESP32's
//! Non-Volatile Storage so it persists across reboots. The blob is written
//! in one `set_raw` call, which NVS commits atomically.

use super::{CredentialStore, Credentials, PersistenceError, MAX_PASSWORD_LEN, MAX_SSID_LEN};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{debug, info, warn};

/// NVS namespace for credential storage.
const NVS_NAMESPACE: &str = "uplink";

/// NVS key for the credential document.
const NVS_KEY: &str = "credentials";

/// Read buffer: JSON keys and quoting plus worst-case escaped values.
const MAX_DOCUMENT_SIZE: usize = 64 + 6 * (MAX_SSID_LEN + MAX_PASSWORD_LEN);

/// Credential document kept in NVS.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    credentials: Credentials,
}

impl NvsStore {
    /// Open the NVS namespace and load the document, creating defaults if
    /// absent.
    pub fn open(partition: EspNvsPartition<NvsDefault>) -> Result<Self, PersistenceError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .map_err(|e| PersistenceError::Storage(format!("{:?}", e)))?;

        let mut store = Self {
            nvs,
            credentials: Credentials::default(),
        };

        match store.read() {
            Ok(Some(credentials)) => {
                info!("Loaded credentials from NVS");
                store.credentials = credentials;
            }
            Ok(None) => {
                info!("No credentials in NVS, creating defaults");
                if let Err(e) = store.write(&Credentials::default()) {
                    warn!("Failed to create default credentials: {}", e);
                }
            }
            Err(e) => warn!("Failed to load credentials from NVS: {}", e),
        }
        Ok(store)
    }

    fn read(&self) -> Result<Option<Credentials>, PersistenceError> {
        let mut buf = [0u8; MAX_DOCUMENT_SIZE];
        let bytes = match self.nvs.get_raw(NVS_KEY, &mut buf) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No credential document in NVS");
                return Ok(None);
            }
            Err(e) => return Err(PersistenceError::Storage(format!("{:?}", e))),
        };
        Ok(Some(serde_json::from_slice(bytes)?))
    }

    fn write(&mut self, credentials: &Credentials) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(credentials)?;
        self.nvs
            .set_raw(NVS_KEY, &json)
            .map_err(|e| PersistenceError::Storage(format!("{:?}", e)))?;
        Ok(())
    }
}

impl CredentialStore for NvsStore {
    fn load(&self) -> Credentials {
        self.credentials.clone()
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), PersistenceError> {
        self.credentials = credentials.clone();
        self.write(credentials).map_err(|e| {
            warn!("Failed to save credentials to NVS: {}", e);
            e
        })
    }
}
