use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::config;
use crate::errors::{AppError, AppResult};

/// Storage key the upload history list is persisted under.
pub const HISTORY_STORAGE_KEY: &str = "uploadedMaps";

/// One record per completed upload. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub name: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

/// Minimal key-value persistence the history list is written through. The
/// store is injected so callers decide where the data lives.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
}

/// Key-value store backed by one JSON file per key.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: PathBuf) -> AppResult<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store rooted in the user's data directory.
    pub fn open_default() -> AppResult<Self> {
        Self::new(config::get_data_directory()?)
    }

    fn key_path(&self, key: &str) -> AppResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(AppError::validation("key", "Invalid storage key"));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let path = self.key_path(key)?;
        fs::write(&path, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let path = self.key_path(key)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Ordered list of completed uploads, oldest first.
pub struct UploadHistory<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> UploadHistory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn entries(&self) -> AppResult<Vec<UploadEntry>> {
        match self.store.get(HISTORY_STORAGE_KEY)? {
            Some(raw) => {
                let entries = serde_json::from_str(&raw).unwrap_or_else(|e| {
                    log::warn!("Failed to parse upload history: {}. Starting fresh.", e);
                    Vec::new()
                });
                Ok(entries)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Append a record for a completed upload.
    pub fn record(&self, name: &str, url: &str) -> AppResult<()> {
        let mut entries = self.entries()?;
        entries.push(UploadEntry {
            name: name.to_string(),
            url: url.to_string(),
            timestamp: Utc::now(),
        });
        self.store
            .set(HISTORY_STORAGE_KEY, &serde_json::to_string(&entries)?)?;

        log::info!("Recorded upload of {} -> {}", name, url);
        Ok(())
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store.remove(HISTORY_STORAGE_KEY)?;
        log::info!("Upload history cleared");
        Ok(())
    }
}
