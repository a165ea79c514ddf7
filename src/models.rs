//! Data models for tillsync.
//!
//! This module defines the core entities: Record, Mutation and DeadLetter,
//! plus the sync status phase broadcast to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Field map carried by a record
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Prefix of locally generated (provisional) record keys
pub const PROVISIONAL_KEY_PREFIX: &str = "local-";

/// Field holding the client-generated identity of a record, when stamped
pub const CLIENT_KEY_FIELD: &str = "_client_key";

/// Generate a provisional record key.
///
/// UUID7 gives a timestamp prefix plus random bits, so keys generated on
/// one device never collide and sort by creation time.
pub fn generate_provisional_key() -> String {
    format!("{}{}", PROVISIONAL_KEY_PREFIX, Uuid::now_v7().simple())
}

/// Build the outbox key for a record: `collection:recordKey`
pub fn outbox_key(collection: &str, record_key: &str) -> String {
    format!("{}:{}", collection, record_key)
}

/// A record in a collection.
///
/// Records are arbitrary field maps addressed by a key that is unique
/// within their collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key of the record within its collection
    pub key: String,
    /// Field payload
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Create a record with the given key and fields
    pub fn new(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Create a record under a freshly generated provisional key
    pub fn provisional(fields: Fields) -> Self {
        Self::new(generate_provisional_key(), fields)
    }

    /// Build a record from a JSON object value. Non-object values yield an
    /// empty field map.
    pub fn from_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let fields = match value {
            serde_json::Value::Object(map) => map,
            _ => Fields::new(),
        };
        Self::new(key, fields)
    }

    /// Get a field value
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Whether the key was generated locally and not yet confirmed remotely
    pub fn has_provisional_key(&self) -> bool {
        self.key.starts_with(PROVISIONAL_KEY_PREFIX)
    }

    /// The client-generated identity stamped on this record, if any
    pub fn client_key(&self) -> Option<&str> {
        self.fields.get(CLIENT_KEY_FIELD).and_then(|v| v.as_str())
    }
}

/// Kind of write intent held in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationAction::Create),
            "update" => Some(MutationAction::Update),
            "delete" => Some(MutationAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued write intent.
///
/// At most one mutation exists per `(collection, record key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Outbox key (`collection:recordKey`)
    pub key: String,
    pub action: MutationAction,
    pub collection: String,
    /// Record state at the time of the write
    pub record: Record,
    /// Queue position; reassigned whenever the entry is superseded
    pub seq: i64,
    /// Number of failed replays so far
    pub attempts: u32,
    /// Error message of the most recent failed replay
    pub last_error: Option<String>,
    /// When the current version of this entry was queued
    pub enqueued_at: DateTime<Utc>,
}

/// A mutation retired from the outbox after too many failed replays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub key: String,
    pub action: MutationAction,
    pub collection: String,
    pub record: Record,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Phase of a drain pass, broadcast to status observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Start,
    End,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Start => "start",
            SyncPhase::End => "end",
        }
    }
}
