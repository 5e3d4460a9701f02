//! Persisted credential store.
//!
//! Holds the last admin key / search text pushed or read from a peripheral.
//! The pair outlives any single GATT session and survives restarts; it is
//! only ever changed by overwriting one field.

use crate::domain::models::{CharacteristicKind, CredentialPair};
use crate::domain::settings::app_config_dir;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Namespace the pair is stored under.
pub const STORE_NAMESPACE: &str = "BLEData";

pub struct SessionStore {
    path: PathBuf,
    pair: Mutex<CredentialPair>,
}

impl SessionStore {
    /// Open the store at `<config dir>/BleTab/BLEData.json`.
    pub fn open_default() -> Result<Self> {
        let mut path = app_config_dir()?;
        path.push(format!("{STORE_NAMESPACE}.json"));
        Self::open(path)
    }

    /// Open (or lazily create) a store backed by `path`.
    ///
    /// A file that no longer parses is treated as empty and replaced on the
    /// next `set`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let pair = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "Corrupt store file, starting empty: {}", e);
                CredentialPair::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CredentialPair::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        debug!(path = %path.display(), "Opened session store");
        Ok(Self {
            path,
            pair: Mutex::new(pair),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current pair; fields may be absent.
    pub fn get(&self) -> CredentialPair {
        self.lock().clone()
    }

    /// Overwrite one field and flush to disk.
    ///
    /// The in-memory pair takes the new value even when the flush fails, so
    /// `get` keeps agreeing with the session; the error only means the value
    /// may not survive a restart.
    pub fn set(&self, field: CharacteristicKind, value: &str) -> Result<CredentialPair> {
        let mut pair = self.lock();
        pair.set(field, value);
        let updated = pair.clone();
        self.flush(&updated)?;
        debug!(key = field.store_key(), "Stored value");
        Ok(updated)
    }

    fn flush(&self, pair: &CredentialPair) -> Result<()> {
        let json = serde_json::to_string_pretty(pair)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CredentialPair> {
        // A poisoned guard still holds a consistent pair: every mutation is a
        // single field assignment.
        self.pair.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
