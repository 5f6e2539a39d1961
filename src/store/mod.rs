// 🗄️ Durable Store - file-backed SQLite, reached only through execution contexts
//
// The store file is the one shared mutable resource. The store hands out one
// long-lived reader context and any number of short-lived writer contexts; the
// handle is passed explicitly to every component that needs it.

mod context;
mod record;
mod schema;
mod session;

pub use context::{ReadOutcome, ReaderContext, WriterContext};
pub use record::{changed_fields, encode_fields, FieldMap, PersistedRecord};
pub use schema::setup_schema;
pub use session::Session;

use crate::config::StoreConfig;
use crate::coordinator::SaveCoordinator;
use crate::error::SyncResult;
use crate::propagation::ChangePropagator;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Reader,
    Writer,
}

/// Open a connection configured for the given role
pub(crate) fn open_connection(config: &StoreConfig, role: ContextRole) -> SyncResult<Connection> {
    let conn = Connection::open(&config.database_path)?;
    conn.busy_timeout(config.busy_timeout())?;
    if config.wal {
        // Enable WAL mode so the reader never blocks writers
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    if role == ContextRole::Reader {
        conn.pragma_update(None, "query_only", true)?;
    }
    Ok(conn)
}

/// One committed save operation, as recorded in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub commit_id: u64,
    pub operation: String,
    pub source: String,
    pub summary: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub struct Store {
    config: StoreConfig,
    commit_seq: Arc<AtomicU64>,
    reader: ReaderContext,
    writers_spawned: AtomicUsize,
}

impl Store {
    /// Open (and create if needed) the store, then spawn the reader context
    pub fn open(config: StoreConfig) -> SyncResult<Self> {
        config.validate()?;

        let last_commit = {
            let conn = open_connection(&config, ContextRole::Writer)?;
            setup_schema(&conn)?;
            schema::last_commit_id(&conn)?
        };

        let commit_seq = Arc::new(AtomicU64::new(last_commit));
        let reader = ReaderContext::spawn(&config, commit_seq.clone())?;

        info!(path = %config.database_path.display(), last_commit, "store opened");
        Ok(Store {
            config,
            commit_seq,
            reader,
            writers_spawned: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn reader(&self) -> ReaderContext {
        self.reader.clone()
    }

    /// Spawn a new writer context. It closes when its last handle is dropped.
    pub fn writer(&self, name: &str) -> SyncResult<WriterContext> {
        let n = self.writers_spawned.fetch_add(1, Ordering::SeqCst) + 1;
        WriterContext::spawn(&format!("{}-{}", name, n), &self.config, self.commit_seq.clone())
    }

    pub fn propagator(&self) -> ChangePropagator {
        ChangePropagator::new(self.reader())
    }

    /// Writer context + coordinator wired to propagate into the reader
    pub fn coordinator(&self, name: &str) -> SyncResult<SaveCoordinator> {
        Ok(SaveCoordinator::new(self.writer(name)?, self.propagator()))
    }

    pub fn last_commit_id(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Most recent journal entries, newest first
    pub async fn recent_commits(&self, limit: usize) -> SyncResult<Vec<CommitEvent>> {
        self.reader
            .perform_read(move |session| {
                let mut stmt = session.connection().prepare(
                    "SELECT commit_id, operation, source, summary, timestamp
                     FROM events ORDER BY commit_id DESC LIMIT ?1",
                )?;
                let events = stmt
                    .query_map([limit as i64], |row| {
                        let summary: String = row.get(3)?;
                        let timestamp: String = row.get(4)?;
                        Ok(CommitEvent {
                            commit_id: row.get::<_, i64>(0)? as u64,
                            operation: row.get(1)?,
                            source: row.get(2)?,
                            summary: serde_json::from_str(&summary).unwrap_or(serde_json::Value::Null),
                            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                                .map(|dt| dt.with_timezone(&Utc))
                                .unwrap_or_default(),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// File-backed store in a temp dir (contexts need separate connections)
    pub(crate) fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("ledger.db"));
        let store = Store::open(config).unwrap();
        (dir, store)
    }
}
