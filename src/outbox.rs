//! Mutation Outbox: durable log of write intents awaiting remote application.
//!
//! The outbox holds at most one entry per `collection:recordKey`. Enqueuing
//! for a key that already has an entry overwrites it in place and gives it a
//! fresh sequence number, which moves it to the back of the queue. Intermediate
//! edits made while offline are therefore never replayed, and the queue is
//! bounded by the number of distinct dirty records.
//!
//! Entries that keep failing are moved to the dead-letter table once they
//! reach the configured attempt threshold.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::database::{lock_database, next_outbox_seq, Database};
use crate::error::{TillError, TillResult};
use crate::models::{outbox_key, DeadLetter, Fields, Mutation, MutationAction, Record};
use crate::validation::validate_record_key;

const MUTATION_COLUMNS: &str =
    "key, seq, action, collection, record_key, record, enqueued_at, attempts, last_error";

const DEAD_LETTER_COLUMNS: &str =
    "key, action, collection, record_key, record, attempts, last_error, dead_lettered_at";

/// What happened to a mutation after a failed replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still queued; will be retried on the next pass
    Retry { attempts: u32 },
    /// Moved to the dead-letter table
    DeadLettered { attempts: u32 },
    /// The entry was replaced or removed while the replay was in flight;
    /// the newer entry keeps a clean attempt count
    Superseded,
}

/// Durable mutation queue backed by the shared database
#[derive(Clone)]
pub struct Outbox {
    db: Arc<Mutex<Database>>,
}

impl Outbox {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Queue a write intent, replacing any entry for the same record
    pub fn enqueue(
        &self,
        action: MutationAction,
        collection: &str,
        record: &Record,
    ) -> TillResult<Mutation> {
        validate_record_key(&record.key)?;

        let mut db = lock_database(&self.db)?;
        db.table_for(collection)?;

        let key = outbox_key(collection, &record.key);
        let payload = serde_json::to_string(&record.fields)?;
        let now = Utc::now();

        let tx = db.connection_mut().transaction()?;
        let seq = next_outbox_seq(&tx)?;
        let replaced = tx
            .query_row("SELECT 1 FROM outbox WHERE key = ?", params![key], |_| Ok(()))
            .optional()?
            .is_some();
        tx.execute(
            r#"
            INSERT INTO outbox (key, seq, action, collection, record_key, record, enqueued_at, attempts, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL)
            ON CONFLICT(key) DO UPDATE SET
                seq = excluded.seq,
                action = excluded.action,
                record = excluded.record,
                enqueued_at = excluded.enqueued_at,
                attempts = 0,
                last_error = NULL
            "#,
            params![
                key,
                seq,
                action.as_str(),
                collection,
                record.key,
                payload,
                now.timestamp()
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            key = %key,
            action = %action,
            seq,
            replaced,
            "Queued mutation"
        );

        Ok(Mutation {
            key,
            action,
            collection: collection.to_string(),
            record: record.clone(),
            seq,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
        })
    }

    /// All queued mutations in queue order
    pub fn drain(&self) -> TillResult<Vec<Mutation>> {
        let db = lock_database(&self.db)?;
        let mut stmt = db.connection().prepare(&format!(
            "SELECT {} FROM outbox ORDER BY seq",
            MUTATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], RawMutation::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawMutation::into_mutation).collect()
    }

    /// Get the queued mutation for an outbox key
    pub fn get(&self, key: &str) -> TillResult<Option<Mutation>> {
        let db = lock_database(&self.db)?;
        get_mutation(db.connection(), key)
    }

    /// Action of the queued mutation for a record, if any
    pub fn pending_action(
        &self,
        collection: &str,
        record_key: &str,
    ) -> TillResult<Option<MutationAction>> {
        Ok(self
            .get(&outbox_key(collection, record_key))?
            .map(|m| m.action))
    }

    /// Remove an entry after it was applied. Returns false if absent.
    pub fn remove(&self, key: &str) -> TillResult<bool> {
        let db = lock_database(&self.db)?;
        let removed = db
            .connection()
            .execute("DELETE FROM outbox WHERE key = ?", params![key])?;
        Ok(removed > 0)
    }

    /// Remove an entry only if it is still the version identified by `seq`.
    ///
    /// A write that superseded the entry while it was being replayed keeps
    /// its place in the queue.
    pub fn remove_if_current(&self, key: &str, seq: i64) -> TillResult<bool> {
        let db = lock_database(&self.db)?;
        let removed = db.connection().execute(
            "DELETE FROM outbox WHERE key = ? AND seq = ?",
            params![key, seq],
        )?;
        Ok(removed > 0)
    }

    /// Number of queued mutations
    pub fn len(&self) -> TillResult<usize> {
        let db = lock_database(&self.db)?;
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> TillResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Record a failed replay of the entry version `seq`.
    ///
    /// Once `max_attempts` failures are reached the entry moves to the
    /// dead-letter table. `None` retries forever.
    pub fn record_failure(
        &self,
        key: &str,
        seq: i64,
        error: &str,
        max_attempts: Option<u32>,
    ) -> TillResult<FailureDisposition> {
        let mut db = lock_database(&self.db)?;
        let tx = db.connection_mut().transaction()?;

        let updated = tx.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE key = ? AND seq = ?",
            params![error, key, seq],
        )?;
        if updated == 0 {
            return Ok(FailureDisposition::Superseded);
        }

        let attempts: u32 = tx.query_row(
            "SELECT attempts FROM outbox WHERE key = ?",
            params![key],
            |row| row.get(0),
        )?;

        let disposition = match max_attempts {
            Some(max) if attempts >= max => {
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO dead_letters
                        (key, action, collection, record_key, record, attempts, last_error, dead_lettered_at)
                    SELECT key, action, collection, record_key, record, attempts, last_error, ?
                    FROM outbox WHERE key = ?
                    "#,
                    params![Utc::now().timestamp(), key],
                )?;
                tx.execute("DELETE FROM outbox WHERE key = ?", params![key])?;
                FailureDisposition::DeadLettered { attempts }
            }
            _ => FailureDisposition::Retry { attempts },
        };
        tx.commit()?;
        Ok(disposition)
    }

    /// Move a pending entry from a provisional record key to the key the
    /// remote assigned.
    ///
    /// Used when a record was written again while its Create was in flight:
    /// the newer entry must target the remote record, so Create becomes
    /// Update. Returns false if there was nothing to move.
    pub fn rekey(&self, collection: &str, old_key: &str, new_key: &str) -> TillResult<bool> {
        validate_record_key(new_key)?;

        let mut db = lock_database(&self.db)?;
        let tx = db.connection_mut().transaction()?;

        let old_outbox_key = outbox_key(collection, old_key);
        let existing = match get_mutation(&tx, &old_outbox_key)? {
            Some(m) => m,
            None => return Ok(false),
        };

        let action = match existing.action {
            MutationAction::Create => MutationAction::Update,
            other => other,
        };
        let new_outbox_key = outbox_key(collection, new_key);
        let payload = serde_json::to_string(&existing.record.fields)?;

        tx.execute("DELETE FROM outbox WHERE key = ?", params![old_outbox_key])?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO outbox
                (key, seq, action, collection, record_key, record, enqueued_at, attempts, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                new_outbox_key,
                existing.seq,
                action.as_str(),
                collection,
                new_key,
                payload,
                existing.enqueued_at.timestamp(),
                existing.attempts,
                existing.last_error
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            from = %old_outbox_key,
            to = %new_outbox_key,
            action = %action,
            "Moved pending mutation to remote key"
        );
        Ok(true)
    }

    /// All dead-lettered mutations, oldest first
    pub fn dead_letters(&self) -> TillResult<Vec<DeadLetter>> {
        let db = lock_database(&self.db)?;
        let mut stmt = db.connection().prepare(&format!(
            "SELECT {} FROM dead_letters ORDER BY dead_lettered_at, key",
            DEAD_LETTER_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], RawDeadLetter::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawDeadLetter::into_dead_letter).collect()
    }

    /// Put a dead-lettered mutation back at the end of the queue with a clean
    /// attempt count. Returns the new entry, or None if there was no such
    /// dead letter. A newer entry queued for the same record in the meantime
    /// wins and the dead letter is simply dropped.
    pub fn requeue_dead_letter(&self, key: &str) -> TillResult<Option<Mutation>> {
        let letter = {
            let db = lock_database(&self.db)?;
            let mut stmt = db.connection().prepare(&format!(
                "SELECT {} FROM dead_letters WHERE key = ?",
                DEAD_LETTER_COLUMNS
            ))?;
            let raw = stmt.query_row(params![key], RawDeadLetter::from_row).optional()?;
            match raw {
                Some(raw) => raw.into_dead_letter()?,
                None => return Ok(None),
            }
        };

        let requeued = match self.get(key)? {
            Some(newer) => newer,
            None => self.enqueue(letter.action, &letter.collection, &letter.record)?,
        };
        self.discard_dead_letter(key)?;

        tracing::info!(key = %key, "Requeued dead-lettered mutation");
        Ok(Some(requeued))
    }

    /// Drop a dead-lettered mutation permanently. Returns false if absent.
    pub fn discard_dead_letter(&self, key: &str) -> TillResult<bool> {
        let db = lock_database(&self.db)?;
        let removed = db
            .connection()
            .execute("DELETE FROM dead_letters WHERE key = ?", params![key])?;
        Ok(removed > 0)
    }
}

fn get_mutation(conn: &Connection, key: &str) -> TillResult<Option<Mutation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM outbox WHERE key = ?",
        MUTATION_COLUMNS
    ))?;
    let raw = stmt.query_row(params![key], RawMutation::from_row).optional()?;
    raw.map(RawMutation::into_mutation).transpose()
}

fn parse_action(value: &str) -> TillResult<MutationAction> {
    MutationAction::from_str(value)
        .ok_or_else(|| TillError::database_op(format!("unknown outbox action '{}'", value)))
}

fn parse_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Outbox row as stored, before decoding
struct RawMutation {
    key: String,
    seq: i64,
    action: String,
    collection: String,
    record_key: String,
    record: String,
    enqueued_at: i64,
    attempts: u32,
    last_error: Option<String>,
}

impl RawMutation {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            seq: row.get(1)?,
            action: row.get(2)?,
            collection: row.get(3)?,
            record_key: row.get(4)?,
            record: row.get(5)?,
            enqueued_at: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_mutation(self) -> TillResult<Mutation> {
        let fields: Fields = serde_json::from_str(&self.record)?;
        Ok(Mutation {
            action: parse_action(&self.action)?,
            key: self.key,
            collection: self.collection,
            record: Record::new(self.record_key, fields),
            seq: self.seq,
            attempts: self.attempts,
            last_error: self.last_error,
            enqueued_at: parse_timestamp(self.enqueued_at),
        })
    }
}

/// Dead-letter row as stored, before decoding
struct RawDeadLetter {
    key: String,
    action: String,
    collection: String,
    record_key: String,
    record: String,
    attempts: u32,
    last_error: Option<String>,
    dead_lettered_at: i64,
}

impl RawDeadLetter {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            action: row.get(1)?,
            collection: row.get(2)?,
            record_key: row.get(3)?,
            record: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            dead_lettered_at: row.get(7)?,
        })
    }

    fn into_dead_letter(self) -> TillResult<DeadLetter> {
        let fields: Fields = serde_json::from_str(&self.record)?;
        Ok(DeadLetter {
            action: parse_action(&self.action)?,
            key: self.key,
            collection: self.collection,
            record: Record::new(self.record_key, fields),
            attempts: self.attempts,
            last_error: self.last_error,
            dead_lettered_at: parse_timestamp(self.dead_lettered_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbox() -> Outbox {
        let db = Database::new_in_memory(&["payments".to_string(), "customers".to_string()])
            .unwrap();
        Outbox::new(Arc::new(Mutex::new(db)))
    }

    fn record(key: &str, value: serde_json::Value) -> Record {
        Record::from_value(key, value)
    }

    #[test]
    fn test_enqueue_computes_key() {
        let outbox = outbox();
        let m = outbox
            .enqueue(MutationAction::Create, "payments", &record("p1", json!({"price": 500})))
            .unwrap();
        assert_eq!(m.key, "payments:p1");
        assert_eq!(outbox.len().unwrap(), 1);
    }

    #[test]
    fn test_repeated_writes_collapse_to_last() {
        let outbox = outbox();
        for price in [100, 200, 300, 400] {
            outbox
                .enqueue(MutationAction::Update, "payments", &record("p1", json!({"price": price})))
                .unwrap();
        }

        let entries = outbox.drain().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, MutationAction::Update);
        assert_eq!(entries[0].record.field("price"), Some(&json!(400)));
    }

    #[test]
    fn test_superseding_write_moves_to_back() {
        let outbox = outbox();
        outbox.enqueue(MutationAction::Update, "payments", &record("a", json!({}))).unwrap();
        outbox.enqueue(MutationAction::Update, "payments", &record("b", json!({}))).unwrap();
        outbox.enqueue(MutationAction::Update, "customers", &record("c", json!({}))).unwrap();
        outbox.enqueue(MutationAction::Delete, "payments", &record("a", json!({}))).unwrap();

        let keys: Vec<String> = outbox.drain().unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["payments:b", "customers:c", "payments:a"]);
    }

    #[test]
    fn test_same_key_in_different_collections_is_distinct() {
        let outbox = outbox();
        outbox.enqueue(MutationAction::Create, "payments", &record("x", json!({}))).unwrap();
        outbox.enqueue(MutationAction::Create, "customers", &record("x", json!({}))).unwrap();
        assert_eq!(outbox.len().unwrap(), 2);
    }

    #[test]
    fn test_enqueue_unsupported_collection_fails() {
        let outbox = outbox();
        let err = outbox
            .enqueue(MutationAction::Create, "invoices", &record("i1", json!({})))
            .unwrap_err();
        assert!(matches!(err, TillError::UnsupportedCollection(_)));
        assert!(outbox.is_empty().unwrap());
    }

    #[test]
    fn test_remove() {
        let outbox = outbox();
        outbox.enqueue(MutationAction::Create, "payments", &record("p1", json!({}))).unwrap();
        assert!(outbox.remove("payments:p1").unwrap());
        assert!(!outbox.remove("payments:p1").unwrap());
        assert!(outbox.is_empty().unwrap());
    }

    #[test]
    fn test_remove_if_current_keeps_newer_version() {
        let outbox = outbox();
        let first = outbox
            .enqueue(MutationAction::Update, "payments", &record("p1", json!({"v": 1})))
            .unwrap();
        outbox
            .enqueue(MutationAction::Update, "payments", &record("p1", json!({"v": 2})))
            .unwrap();

        assert!(!outbox.remove_if_current("payments:p1", first.seq).unwrap());
        let remaining = outbox.get("payments:p1").unwrap().unwrap();
        assert_eq!(remaining.record.field("v"), Some(&json!(2)));
    }

    #[test]
    fn test_pending_action() {
        let outbox = outbox();
        assert_eq!(outbox.pending_action("payments", "p1").unwrap(), None);
        outbox.enqueue(MutationAction::Create, "payments", &record("p1", json!({}))).unwrap();
        assert_eq!(
            outbox.pending_action("payments", "p1").unwrap(),
            Some(MutationAction::Create)
        );
    }

    #[test]
    fn test_record_failure_counts_attempts() {
        let outbox = outbox();
        let m = outbox.enqueue(MutationAction::Update, "payments", &record("p1", json!({}))).unwrap();

        let first = outbox.record_failure(&m.key, m.seq, "timeout", Some(3)).unwrap();
        assert_eq!(first, FailureDisposition::Retry { attempts: 1 });

        let stored = outbox.get(&m.key).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_unbounded_retry_never_dead_letters() {
        let outbox = outbox();
        let m = outbox.enqueue(MutationAction::Update, "payments", &record("p1", json!({}))).unwrap();
        for _ in 0..50 {
            outbox.record_failure(&m.key, m.seq, "still down", None).unwrap();
        }
        assert_eq!(outbox.get(&m.key).unwrap().unwrap().attempts, 50);
        assert!(outbox.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_threshold_moves_to_dead_letters() {
        let outbox = outbox();
        let m = outbox
            .enqueue(MutationAction::Update, "payments", &record("p1", json!({"price": 9})))
            .unwrap();

        outbox.record_failure(&m.key, m.seq, "rejected", Some(2)).unwrap();
        let last = outbox.record_failure(&m.key, m.seq, "rejected", Some(2)).unwrap();
        assert_eq!(last, FailureDisposition::DeadLettered { attempts: 2 });
        assert!(outbox.is_empty().unwrap());

        let letters = outbox.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].key, "payments:p1");
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].record.field("price"), Some(&json!(9)));
    }

    #[test]
    fn test_failure_on_superseded_entry_is_ignored() {
        let outbox = outbox();
        let old = outbox.enqueue(MutationAction::Update, "payments", &record("p1", json!({}))).unwrap();
        outbox.enqueue(MutationAction::Update, "payments", &record("p1", json!({"v": 2}))).unwrap();

        let disposition = outbox.record_failure(&old.key, old.seq, "late", Some(1)).unwrap();
        assert_eq!(disposition, FailureDisposition::Superseded);
        assert_eq!(outbox.get("payments:p1").unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn test_requeue_and_discard_dead_letter() {
        let outbox = outbox();
        let m = outbox.enqueue(MutationAction::Delete, "payments", &record("p1", json!({}))).unwrap();
        outbox.record_failure(&m.key, m.seq, "gone", Some(1)).unwrap();

        let requeued = outbox.requeue_dead_letter("payments:p1").unwrap().unwrap();
        assert_eq!(requeued.action, MutationAction::Delete);
        assert_eq!(requeued.attempts, 0);
        assert!(outbox.dead_letters().unwrap().is_empty());
        assert_eq!(outbox.len().unwrap(), 1);

        assert!(outbox.requeue_dead_letter("payments:p1").unwrap().is_none());
        assert!(!outbox.discard_dead_letter("payments:nothing").unwrap());
    }

    #[test]
    fn test_rekey_turns_create_into_update() {
        let outbox = outbox();
        outbox
            .enqueue(MutationAction::Create, "payments", &record("local-1", json!({"price": 5})))
            .unwrap();

        assert!(outbox.rekey("payments", "local-1", "srv-9").unwrap());
        assert!(outbox.get("payments:local-1").unwrap().is_none());

        let moved = outbox.get("payments:srv-9").unwrap().unwrap();
        assert_eq!(moved.action, MutationAction::Update);
        assert_eq!(moved.record.key, "srv-9");
        assert_eq!(moved.record.field("price"), Some(&json!(5)));

        assert!(!outbox.rekey("payments", "local-1", "srv-9").unwrap());
    }

    #[test]
    fn test_outbox_survives_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("outbox.db");
        let collections = vec!["payments".to_string()];

        {
            let db = Database::new(&path, &collections).unwrap();
            let outbox = Outbox::new(Arc::new(Mutex::new(db)));
            outbox
                .enqueue(MutationAction::Create, "payments", &record("p1", json!({"price": 500})))
                .unwrap();
        }

        let db = Database::new(&path, &collections).unwrap();
        let outbox = Outbox::new(Arc::new(Mutex::new(db)));
        let entries = outbox.drain().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.key, "p1");
    }
}
