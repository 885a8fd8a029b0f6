//! Uplink credentials and their persistence.
//!
//! # Components
//!
//! - [`Credentials`] - SSID + password pair with the clear-on-rename rule
//! - [`CredentialStore`] - persistence contract the core depends on
//! - [`FileStore`] - JSON document on the host filesystem
//! - [`NvsStore`] - the same document in ESP32 NVS (ESP32 only)
//! - [`MemoryStore`] - volatile store for tests and fallbacks
//!
//! # Document Format
//!
//! ```json
//! {"wifi_ssid": "MyNetwork", "wifi_pass": "MyPassword"}
//! ```

mod file_store;
#[cfg(feature = "esp32")]
mod nvs_store;

pub use file_store::FileStore;
#[cfg(feature = "esp32")]
pub use nvs_store::NvsStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Uplink network name and passphrase.
///
/// The SSID and password only ever change together in one direction: giving
/// the credentials a new SSID always clears the password, so a stale password
/// is never paired with a different (or empty) network name.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    #[serde(rename = "wifi_ssid", default)]
    ssid: String,
    #[serde(rename = "wifi_pass", default)]
    password: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// True when there is no network to associate with.
    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    /// Replace the SSID and clear the password in the same update.
    pub fn set_ssid(&mut self, ssid: impl Into<String>) {
        self.password.zeroize();
        self.ssid = ssid.into();
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password.zeroize();
        self.password = password.into();
    }

    pub fn get(&self, field: CredentialField) -> &str {
        match field {
            CredentialField::Ssid => &self.ssid,
            CredentialField::Password => &self.password,
        }
    }

    pub fn set(&mut self, field: CredentialField, value: impl Into<String>) {
        match field {
            CredentialField::Ssid => self.set_ssid(value),
            CredentialField::Password => self.set_password(value),
        }
    }

    /// Reset a field to empty. Clearing the SSID clears the password too.
    pub fn clear(&mut self, field: CredentialField) {
        self.set(field, String::new());
    }

    /// Check the values against 802.11/WPA2 limits.
    ///
    /// Provisioning does not refuse out-of-range values (the access point is
    /// the final judge); this is used to warn early.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }
        if !self.password.is_empty() && self.password.len() < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort {
                len: self.password.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// The two fields of the credential document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Ssid,
    Password,
}

impl CredentialField {
    /// Key used in the persisted document.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Ssid => "wifi_ssid",
            Self::Password => "wifi_pass",
        }
    }
}

/// Durable credential persistence.
///
/// Implementations keep an in-memory copy of the document: `load` never
/// fails, and a failed write still leaves the new value visible in memory.
pub trait CredentialStore: Send {
    /// Current document (defaults when nothing could be read).
    fn load(&self) -> Credentials;

    /// Replace the whole document.
    fn save(&mut self, credentials: &Credentials) -> Result<(), PersistenceError>;

    fn get(&self, field: CredentialField) -> String {
        self.load().get(field).to_string()
    }

    /// Write one field and persist the whole document.
    fn set(&mut self, field: CredentialField, value: &str) -> Result<(), PersistenceError> {
        let mut credentials = self.load();
        credentials.set(field, value);
        self.save(&credentials)
    }

    /// Reset one field to its default.
    fn remove(&mut self, field: CredentialField) -> Result<(), PersistenceError> {
        let mut credentials = self.load();
        credentials.clear(field);
        self.save(&credentials)
    }
}

/// Capability for handing new credentials to whatever associates with them.
pub trait CredentialSink: Send + Sync {
    /// Take `credentials` as the new target network. Must not block.
    fn apply(&self, credentials: Credentials);
}

/// Volatile store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: Credentials,
}

impl MemoryStore {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Credentials {
        self.credentials.clone()
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), PersistenceError> {
        self.credentials = credentials.clone();
        Ok(())
    }
}

/// Invalid credential values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// Failure to read or write the credential document.
#[derive(Debug)]
pub enum PersistenceError {
    /// Filesystem error.
    Io(std::io::Error),
    /// The document could not be encoded or decoded.
    Format(serde_json::Error),
    /// Platform storage error (NVS).
    Storage(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Format(e) => write!(f, "invalid credential document: {}", e),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Format(e) => Some(e),
            Self::Storage(_) => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let creds = Credentials::default();
        assert!(creds.is_empty());
        assert_eq!(creds.ssid(), "");
        assert_eq!(creds.password(), "");
    }

    #[test]
    fn test_set_ssid_clears_password() {
        let mut creds = Credentials::new("HomeNet", "password123");
        creds.set_ssid("OfficeNet");
        assert_eq!(creds.ssid(), "OfficeNet");
        assert_eq!(creds.password(), "");
    }

    #[test]
    fn test_set_same_ssid_still_clears_password() {
        let mut creds = Credentials::new("HomeNet", "password123");
        creds.set(CredentialField::Ssid, "HomeNet");
        assert_eq!(creds.password(), "");
    }

    #[test]
    fn test_set_password_keeps_ssid() {
        let mut creds = Credentials::new("HomeNet", "");
        creds.set_password("password123");
        assert_eq!(creds.ssid(), "HomeNet");
        assert_eq!(creds.password(), "password123");
    }

    #[test]
    fn test_clear_ssid_clears_password() {
        let mut creds = Credentials::new("HomeNet", "password123");
        creds.clear(CredentialField::Ssid);
        assert_eq!(creds, Credentials::default());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("HomeNet", "hunter2hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("HomeNet"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_document_keys() {
        let json = serde_json::to_string(&Credentials::new("a", "b")).unwrap();
        assert_eq!(json, r#"{"wifi_ssid":"a","wifi_pass":"b"}"#);
        assert_eq!(CredentialField::Ssid.key(), "wifi_ssid");
        assert_eq!(CredentialField::Password.key(), "wifi_pass");
    }

    #[test]
    fn test_document_missing_field_defaults() {
        let creds: Credentials = serde_json::from_str(r#"{"wifi_ssid":"a"}"#).unwrap();
        assert_eq!(creds, Credentials::new("a", ""));
    }

    #[test]
    fn test_validate() {
        assert!(Credentials::new("Net", "12345678").validate().is_ok());
        assert!(Credentials::new("Net", "").validate().is_ok());
        assert_eq!(
            Credentials::new("", "12345678").validate(),
            Err(CredentialError::SsidEmpty)
        );
        assert!(matches!(
            Credentials::new("a".repeat(33), "").validate(),
            Err(CredentialError::SsidTooLong { .. })
        ));
        assert!(matches!(
            Credentials::new("Net", "short").validate(),
            Err(CredentialError::PasswordTooShort { .. })
        ));
        assert!(matches!(
            Credentials::new("Net", "a".repeat(65)).validate(),
            Err(CredentialError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_store_set_ssid_clears_password() {
        let mut store = MemoryStore::new(Credentials::new("HomeNet", "password123"));
        store.set(CredentialField::Ssid, "OfficeNet").unwrap();
        assert_eq!(store.get(CredentialField::Ssid), "OfficeNet");
        assert_eq!(store.get(CredentialField::Password), "");
    }

    #[test]
    fn test_store_remove() {
        let mut store = MemoryStore::new(Credentials::new("HomeNet", "password123"));
        store.remove(CredentialField::Password).unwrap();
        assert_eq!(store.load(), Credentials::new("HomeNet", ""));
        store.remove(CredentialField::Ssid).unwrap();
        assert_eq!(store.load(), Credentials::default());
    }
}
