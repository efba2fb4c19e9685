use rusqlite::Connection;

use super::StoreError;
use super::write::map_sql_error;

/// Bumped whenever the table layout changes.
pub(super) const SCHEMA_VERSION: i64 = 1;

pub(super) fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;
         PRAGMA temp_store=MEMORY;",
    )
    .map_err(map_sql_error)
}

/// One-time upgrade keyed on `PRAGMA user_version`.
pub(super) fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(map_sql_error)?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS cards (
            card_key INTEGER PRIMARY KEY,
            name TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS card_features (
            card_key INTEGER NOT NULL REFERENCES cards(card_key) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (card_key, position)
         ) WITHOUT ROWID;
         CREATE TABLE IF NOT EXISTS model_artifacts (
            name TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            saved_at INTEGER NOT NULL
         );
         PRAGMA user_version = {SCHEMA_VERSION};
         COMMIT;"
    ))
    .map_err(map_sql_error)
}
