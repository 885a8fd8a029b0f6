//! Credential persistence for host (development) builds.
//!
//! Stores the credential document as JSON so it survives restarts. Uses
//! `~/.sensor-link/config.json` by default (see
//! [`HostSettings`](crate::config::HostSettings)).
//!
//! # Usage
//!
//! ```no_run
//! use sensor_link::credentials::{CredentialField, CredentialStore, FileStore};
//!
//! let mut store = FileStore::open("/tmp/sensor-link.json");
//! store.set(CredentialField::Ssid, "MyNetwork")?;
//! # Ok::<(), sensor_link::credentials::PersistenceError>(())
//! ```

use super::{CredentialStore, Credentials, PersistenceError};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// JSON credential document on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    credentials: Credentials,
}

impl FileStore {
    /// Open the document at `path`, creating it with defaults if absent.
    ///
    /// Never fails: read, parse and create errors are logged and the store
    /// starts from in-memory defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let credentials = match load_from(&path) {
            Ok(Some(credentials)) => {
                info!("Loaded credentials from {:?}", path);
                credentials
            }
            Ok(None) => {
                info!("No credential document at {:?}, creating defaults", path);
                let defaults = Credentials::default();
                if let Err(e) = write_atomic(&path, &defaults) {
                    warn!("Failed to create default credential document: {}", e);
                }
                defaults
            }
            Err(e) => {
                warn!("Failed to load credential document: {}", e);
                Credentials::default()
            }
        };
        Self { path, credentials }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Credentials {
        self.credentials.clone()
    }

    fn save(&mut self, credentials: &Credentials) -> Result<(), PersistenceError> {
        self.credentials = credentials.clone();
        write_atomic(&self.path, credentials).map_err(|e| {
            warn!("Failed to save credential document: {}", e);
            e
        })
    }
}

/// Read the document; `Ok(None)` when the file does not exist.
fn load_from(path: &Path) -> Result<Option<Credentials>, PersistenceError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No credential document found at {:?}", path);
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

/// Rewrite the whole document: write a sibling temp file, then rename over.
/// Write to a sibling temp file, flush it to disk, then rename over `path`.
fn write_atomic(path: &Path, credentials: &Credentials) -> Result<(), PersistenceError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string(credentials)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    // Persist the rename itself; not every platform can open a directory.
    if let Ok(dir) = File::open(parent.unwrap_or_else(|| Path::new("."))) {
        let _ = dir.sync_all();
    }
    Ok(())
}
