//! File-backed record store with crash recovery
//!
//! Records are kept in one JSON file. Every write goes to a temporary
//! file first and is renamed into place, with the previous good state
//! copied to a `.backup` beside it; a corrupted main file is recovered
//! from the backup on load.
//!
//! ## File format
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "records": {
//!     "h1.example.com": {
//!       "hostname": "h1.example.com",
//!       "current_ip": "10.0.0.5",
//!       "owner_id": "u1",
//!       "status": "online",
//!       "first_seen": "2025-01-01T00:00:00Z",
//!       "last_seen": "2025-01-01T00:05:00Z",
//!       "dns_sync_status": "synced",
//!       "dns_zone": "prism.example",
//!       "dns_record_id": "h1.example.com.prism.example./A"
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::registry::HostRecord;
use crate::traits::record_store::RecordStore;

/// Record file format version
const RECORD_FILE_VERSION: &str = "1.0";

/// Serializable file layout
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RecordFileFormat {
    version: String,
    records: HashMap<String, HostRecord>,
}

/// File-backed record store
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    records: Arc<RwLock<HashMap<String, HostRecord>>>,
}

impl FileRecordStore {
    /// Create or load a file record store
    ///
    /// Creates parent directories as needed, then loads the existing file,
    /// falling back to the backup (and finally to an empty set) if the
    /// main file is corrupted.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "failed to create state directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let records = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            records: Arc::new(RwLock::new(records)),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<HashMap<String, HostRecord>, Error> {
        match Self::load_file(path).await {
            Ok(records) => {
                debug!(records = records.len(), "loaded record file");
                Ok(records)
            }
            Err(Error::Json(parse_err)) => {
                warn!(
                    "record file appears corrupted ({parse_err}); attempting recovery from backup"
                );
                let backup = Self::backup_path(path);
                if backup.exists() {
                    match Self::load_file(&backup).await {
                        Ok(records) => {
                            info!(records = records.len(), "recovered records from backup");
                            if let Err(e) = fs::copy(&backup, path).await {
                                warn!("failed to restore record file from backup: {e}");
                            }
                            Ok(records)
                        }
                        Err(e) => {
                            warn!("backup also unreadable ({e}); starting with no records");
                            Ok(HashMap::new())
                        }
                    }
                } else {
                    warn!("no backup file found; starting with no records");
                    Ok(HashMap::new())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load_file(path: &Path) -> Result<HashMap<String, HostRecord>, Error> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::record_store(format!("failed to read {}: {e}", path.display()))
        })?;

        let file: RecordFileFormat = serde_json::from_str(&content)?;

        if file.version != RECORD_FILE_VERSION {
            warn!(
                "record file version mismatch: expected {RECORD_FILE_VERSION}, got {}; loading anyway",
                file.version
            );
        }

        Ok(file.records)
    }

    /// Serialize the current set and atomically replace the file
    async fn write_file(&self) -> Result<(), Error> {
        let snapshot = {
            let records = self.records.read().await;
            RecordFileFormat {
                version: RECORD_FILE_VERSION.to_string(),
                records: records.clone(),
            }
        };

        let json = serde_json::to_string_pretty(&snapshot)?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp).await.map_err(|e| {
                Error::record_store(format!("failed to create {}: {e}", temp.display()))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::record_store(format!("failed to write {}: {e}", temp.display()))
            })?;
            file.flush().await.map_err(|e| {
                Error::record_store(format!("failed to flush {}: {e}", temp.display()))
            })?;
        }

        if self.path.exists() {
            let backup = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup).await {
                warn!("failed to refresh record backup: {e}");
            }
        }

        fs::rename(&temp, &self.path).await.map_err(|e| {
            Error::record_store(format!(
                "failed to rename {} to {}: {e}",
                temp.display(),
                self.path.display()
            ))
        })?;

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load_all(&self) -> Result<Vec<HostRecord>, Error> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn put(&self, record: &HostRecord) -> Result<(), Error> {
        {
            let mut records = self.records.write().await;
            records.insert(record.hostname.clone(), record.clone());
        }
        self.write_file().await
    }

    async fn flush_all(&self, snapshot: &[HostRecord]) -> Result<(), Error> {
        {
            let mut records = self.records.write().await;
            records.clear();
            for record in snapshot {
                records.insert(record.hostname.clone(), record.clone());
            }
        }
        self.write_file().await
    }
}
