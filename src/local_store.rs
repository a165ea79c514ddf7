//! Local Store: durable per-collection record cache.
//!
//! Every operation is a single statement or a single transaction, so a
//! failed write never leaves a keyed slot half-written. The store knows
//! nothing about sync state.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{lock_database, Database};
use crate::error::{TillError, TillResult};
use crate::models::{Fields, Record};
use crate::validation::{validate_fields, validate_record_key};

/// Keyed record cache backed by the shared database
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Fail unless the collection is supported
    pub fn ensure_supported(&self, collection: &str) -> TillResult<()> {
        lock_database(&self.db)?.table_for(collection)?;
        Ok(())
    }

    /// Get all records of a collection, in first-insertion order
    pub fn get_all(&self, collection: &str) -> TillResult<Vec<Record>> {
        let db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;

        let mut stmt = db
            .connection()
            .prepare(&format!("SELECT key, fields FROM {} ORDER BY rowid", table))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, fields)| -> TillResult<Record> {
                Ok(Record::new(key, parse_fields(&fields)?))
            })
            .collect()
    }

    /// Get a single record
    pub fn get(&self, collection: &str, key: &str) -> TillResult<Option<Record>> {
        let db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;

        let fields: Option<String> = db
            .connection()
            .query_row(
                &format!("SELECT fields FROM {} WHERE key = ?", table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        fields
            .map(|f| -> TillResult<Record> { Ok(Record::new(key, parse_fields(&f)?)) })
            .transpose()
    }

    /// Insert or replace a record by key
    pub fn put(&self, collection: &str, record: &Record) -> TillResult<()> {
        validate_record_key(&record.key)?;
        validate_fields(&record.fields)?;

        let db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;
        upsert(db.connection(), &table, record)?;

        tracing::trace!(collection = %collection, key = %record.key, "Stored record");
        Ok(())
    }

    /// Insert or replace many records in one transaction
    pub fn put_many(&self, collection: &str, records: &[Record]) -> TillResult<()> {
        for record in records {
            validate_record_key(&record.key)?;
            validate_fields(&record.fields)?;
        }

        let mut db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;
        let tx = db.connection_mut().transaction()?;
        for record in records {
            upsert(&tx, &table, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a record. Fails with NotFound if the key does not exist.
    pub fn delete(&self, collection: &str, key: &str) -> TillResult<()> {
        let db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;

        let deleted = db
            .connection()
            .execute(&format!("DELETE FROM {} WHERE key = ?", table), params![key])?;
        if deleted == 0 {
            return Err(TillError::record_not_found(collection, key));
        }

        tracing::trace!(collection = %collection, key = %key, "Deleted record");
        Ok(())
    }

    /// Delete every listed key that exists, in one transaction. Returns the
    /// number of records removed.
    pub fn purge(&self, collection: &str, keys: &[String]) -> TillResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;
        let tx = db.connection_mut().transaction()?;
        let mut removed = 0;
        for key in keys {
            removed += tx.execute(&format!("DELETE FROM {} WHERE key = ?", table), params![key])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Replace the record stored under `old_key` with `record` (stored under
    /// its own key) atomically. The store never holds both at once.
    pub fn rekey(&self, collection: &str, old_key: &str, record: &Record) -> TillResult<()> {
        validate_record_key(&record.key)?;
        validate_fields(&record.fields)?;

        let mut db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;
        let tx = db.connection_mut().transaction()?;
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE key = ?", table),
            params![old_key],
        )?;
        upsert(&tx, &table, record)?;
        tx.commit()?;

        if removed == 0 {
            tracing::debug!(
                collection = %collection,
                old_key = %old_key,
                "Rekeyed record had no local copy under its old key"
            );
        }
        Ok(())
    }

    /// Number of records in a collection
    pub fn count(&self, collection: &str) -> TillResult<usize> {
        let db = lock_database(&self.db)?;
        let table = db.table_for(collection)?;
        let count: i64 = db
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert(conn: &rusqlite::Connection, table: &str, record: &Record) -> TillResult<()> {
    let fields = serde_json::to_string(&record.fields)?;
    conn.execute(
        &format!(
            r#"
            INSERT INTO {} (key, fields, modified_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                fields = excluded.fields,
                modified_at = excluded.modified_at
            "#,
            table
        ),
        params![record.key, fields, Utc::now().timestamp()],
    )?;
    Ok(())
}

fn parse_fields(raw: &str) -> TillResult<Fields> {
    Ok(serde_json::from_str(raw)?)
}
