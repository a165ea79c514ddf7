//! Database handle for tillsync.
//!
//! This module owns the SQLite connection and the schema: one table per
//! supported collection (`records_<name>`), the outbox, the dead-letter table
//! and a small key/value table for counters. The typed operations live in
//! `local_store` and `outbox`, which borrow the connection from here.
//!
//! All timestamps are Unix seconds (INTEGER).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::error::{TillError, TillResult};
use crate::validation::{validate_collection_name, validate_supported_collection};

/// Prefix of per-collection record tables
pub const RECORD_TABLE_PREFIX: &str = "records_";

/// Name of the outbox sequence counter in `sync_meta`
const OUTBOX_SEQ_COUNTER: &str = "outbox_seq";

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
    collections: Vec<String>,
}

/// Lock a shared database, mapping a poisoned mutex to an error.
pub fn lock_database(db: &Mutex<Database>) -> TillResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| TillError::database_op("database lock poisoned"))
}

impl Database {
    /// Open (or create) the database file and ensure a table exists for every
    /// supported collection.
    pub fn new<P: AsRef<Path>>(db_path: P, collections: &[String]) -> TillResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let mut db = Self {
            conn,
            collections: Vec::new(),
        };
        db.init_database()?;
        db.migrate_add_outbox_attempt_columns()?;
        for name in collections {
            db.ensure_collection(name)?;
        }
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory(collections: &[String]) -> TillResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self {
            conn,
            collections: Vec::new(),
        };
        db.init_database()?;
        db.migrate_add_outbox_attempt_columns()?;
        for name in collections {
            db.ensure_collection(name)?;
        }
        Ok(db)
    }

    /// Initialize the sync schema (outbox, dead letters, counters)
    pub fn init_database(&mut self) -> TillResult<()> {
        self.conn.execute_batch(
            r#"
            -- Pending write intents, one row per collection:recordKey
            CREATE TABLE IF NOT EXISTS outbox (
                key TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                action TEXT NOT NULL,
                collection TEXT NOT NULL,
                record_key TEXT NOT NULL,
                record TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_seq ON outbox(seq);

            -- Mutations retired after too many failed replays
            CREATE TABLE IF NOT EXISTS dead_letters (
                key TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                collection TEXT NOT NULL,
                record_key TEXT NOT NULL,
                record TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                dead_lettered_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO sync_meta (name, value) VALUES (?, 0)",
            params![OUTBOX_SEQ_COUNTER],
        )?;
        Ok(())
    }

    /// Migrate outbox tables created before replay attempts were tracked.
    ///
    /// This is idempotent - it checks if columns exist before adding them.
    fn migrate_add_outbox_attempt_columns(&mut self) -> TillResult<()> {
        if !self.column_exists("outbox", "attempts")? {
            self.conn.execute(
                "ALTER TABLE outbox ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            tracing::info!("Added attempts column to outbox");
        }

        if !self.column_exists("outbox", "last_error")? {
            self.conn
                .execute("ALTER TABLE outbox ADD COLUMN last_error TEXT", [])?;
            tracing::info!("Added last_error column to outbox");
        }

        Ok(())
    }

    fn column_exists(&self, table: &str, column: &str) -> TillResult<bool> {
        let sql = format!("PRAGMA table_info({})", table);
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|name| name == column))
    }

    /// Create the record table for a collection and add it to the supported
    /// set. Returns false if it was already supported.
    pub fn ensure_collection(&mut self, name: &str) -> TillResult<bool> {
        validate_collection_name(name)?;
        if self.collections.iter().any(|c| c == name) {
            return Ok(false);
        }

        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                modified_at INTEGER NOT NULL
            );
            "#,
            table = record_table(name)
        ))?;
        self.collections.push(name.to_string());
        tracing::debug!(collection = %name, "Collection table ready");
        Ok(true)
    }

    /// Supported collection names
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// Resolve the record table of a supported collection
    pub fn table_for(&self, collection: &str) -> TillResult<String> {
        validate_supported_collection(collection, &self.collections)?;
        Ok(record_table(collection))
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get the underlying connection mutably (for transactions)
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Close the database connection
    pub fn close(self) -> TillResult<()> {
        self.conn
            .close()
            .map_err(|(_, e)| TillError::Database(e))
    }
}

/// Allocate the next outbox sequence number.
///
/// Takes a connection so it can run inside the caller's transaction. The
/// counter never goes backwards, so a superseding write always sorts after
/// every entry that existed before it.
pub fn next_outbox_seq(conn: &Connection) -> TillResult<i64> {
    conn.execute(
        "UPDATE sync_meta SET value = value + 1 WHERE name = ?",
        params![OUTBOX_SEQ_COUNTER],
    )?;
    let seq = conn.query_row(
        "SELECT value FROM sync_meta WHERE name = ?",
        params![OUTBOX_SEQ_COUNTER],
        |row| row.get(0),
    )?;
    Ok(seq)
}

fn record_table(collection: &str) -> String {
    format!("{}{}", RECORD_TABLE_PREFIX, collection)
}
