// ⚙️ Store configuration
//
// Loaded from a JSON file or built in code; environment overrides for the CLI.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SQLite caps bound parameters per statement; lookups chunk below this.
pub const MAX_LOOKUP_CHUNK: usize = 900;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the SQLite file backing the ledger
    pub database_path: PathBuf,

    /// How long a context waits for the write lock before the commit fails
    pub busy_timeout_ms: u64,

    /// Rows per bulk INSERT pass
    pub bulk_batch_size: usize,

    /// Keys per `id IN (...)` lookup when prefetching references
    pub lookup_chunk_size: usize,

    /// Write-ahead logging (required for a reader alongside writers)
    pub wal: bool,
}

impl StoreConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database_path: database_path.into(),
            busy_timeout_ms: 5_000,
            bulk_batch_size: 500,
            lookup_chunk_size: 500,
            wal: true,
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size;
        self
    }

    pub fn with_lookup_chunk_size(mut self, size: usize) -> Self {
        self.lookup_chunk_size = size;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LEDGER_DB_PATH` and `LEDGER_BULK_BATCH_SIZE` overrides.
    pub fn from_env(mut self) -> SyncResult<Self> {
        if let Ok(path) = std::env::var("LEDGER_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("LEDGER_BULK_BATCH_SIZE") {
            self.bulk_batch_size = size.parse().map_err(|_| {
                SyncError::InvalidConfig(format!("LEDGER_BULK_BATCH_SIZE is not a number: {}", size))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.bulk_batch_size == 0 {
            return Err(SyncError::InvalidConfig("bulk_batch_size must be > 0".into()));
        }
        if self.lookup_chunk_size == 0 || self.lookup_chunk_size > MAX_LOOKUP_CHUNK {
            return Err(SyncError::InvalidConfig(format!(
                "lookup_chunk_size must be in 1..={}",
                MAX_LOOKUP_CHUNK
            )));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("ledger.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.bulk_batch_size, 500);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert!(config.wal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"database_path": "/tmp/x.db", "bulk_batch_size": 42}}"#).unwrap();

        let config = StoreConfig::load(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.bulk_batch_size, 42);
        assert_eq!(config.lookup_chunk_size, 500);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = StoreConfig::default().with_bulk_batch_size(0);
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let config = StoreConfig::default().with_lookup_chunk_size(MAX_LOOKUP_CHUNK + 1);
        assert!(config.validate().is_err());
    }
}
