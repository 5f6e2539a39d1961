// 🗄️ Schema - one flat table per entity kind, plus live links and the commit journal
//
// `id` is indexed but not UNIQUE: legacy identity collisions must stay
// representable so reconciliation can repair them.

use crate::entities::EntityKind;
use rusqlite::Connection;

pub fn setup_schema(conn: &Connection) -> rusqlite::Result<()> {
    // ==========================================================================
    // Entity tables (uniform layout, payload is the entity's JSON object)
    // ==========================================================================
    for kind in EntityKind::ALL {
        let table = kind.table();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                sort_key TEXT,
                fingerprint TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_id ON {table}(id);
            CREATE INDEX IF NOT EXISTS idx_{table}_sort_key ON {table}(sort_key);"
        ))?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_fingerprint ON transactions(fingerprint)",
        [],
    )?;

    // ==========================================================================
    // Live links (target_row NULL = dangling, soft key kept in target_key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_links (
            link_id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_table TEXT NOT NULL,
            owner_row INTEGER NOT NULL,
            ref_name TEXT NOT NULL,
            target_table TEXT NOT NULL,
            target_key TEXT NOT NULL,
            target_row INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_owner ON record_links(owner_table, owner_row)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_target ON record_links(target_table, target_row)",
        [],
    )?;

    // ==========================================================================
    // Commit journal (one row per committed save operation)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            commit_id INTEGER UNIQUE NOT NULL,
            operation TEXT NOT NULL,
            source TEXT NOT NULL,
            summary TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// Highest commit id in the journal, so a reopened store keeps ids monotonic
pub fn last_commit_id(conn: &Connection) -> rusqlite::Result<u64> {
    let last: Option<i64> = conn.query_row("SELECT MAX(commit_id) FROM events", [], |row| row.get(0))?;
    Ok(last.unwrap_or(0).max(0) as u64)
}
