//! Repository: the application-facing read/write path.
//!
//! Writes land in the Local Store first. When online with nothing pending
//! for the record they go straight to the remote; otherwise, or if the
//! remote call fails, they are queued in the outbox for the sync engine.
//!
//! Queued actions fold: an update of a record whose Create is still queued
//! stays a Create with the new payload, and deleting such a record drops the
//! entry since the object never reached the remote.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityOracle;
use crate::error::{RemoteError, TillError, TillResult};
use crate::local_store::LocalStore;
use crate::models::{outbox_key, Fields, MutationAction, Record, CLIENT_KEY_FIELD};
use crate::outbox::Outbox;
use crate::reconcile::merge;
use crate::remote::RemoteStore;
use crate::validation::validate_fields;

pub struct Repository<R> {
    store: LocalStore,
    outbox: Outbox,
    remote: Arc<R>,
    connectivity: Arc<ConnectivityOracle>,
    stamp_client_key: bool,
}

impl<R: RemoteStore> Repository<R> {
    pub fn new(
        store: LocalStore,
        outbox: Outbox,
        remote: Arc<R>,
        connectivity: Arc<ConnectivityOracle>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            outbox,
            remote,
            connectivity,
            stamp_client_key: config.stamp_client_key,
        }
    }

    /// Read a record from the Local Store
    pub fn get(&self, collection: &str, key: &str) -> TillResult<Option<Record>> {
        self.store.get(collection, key)
    }

    /// Create a record and return it under the key it is stored with.
    ///
    /// Online, the remote assigns the key. Offline, or if the remote call
    /// fails, the record gets a provisional key and a queued Create.
    pub async fn create(&self, collection: &str, fields: Fields) -> TillResult<Record> {
        validate_fields(&fields)?;
        self.store.ensure_supported(collection)?;

        let mut record = Record::provisional(fields);
        if self.stamp_client_key {
            record.fields.insert(
                CLIENT_KEY_FIELD.to_string(),
                serde_json::Value::String(record.key.clone()),
            );
        }

        if self.connectivity.is_online() {
            match self.remote.create(collection, &record.fields).await {
                Ok(key) => {
                    let created = Record::new(key, record.fields);
                    self.store.put(collection, &created)?;
                    tracing::debug!(collection = %collection, key = %created.key, "Created remotely");
                    return Ok(created);
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Remote create failed, queueing");
                }
            }
        }

        self.store.put(collection, &record)?;
        self.outbox
            .enqueue(MutationAction::Create, collection, &record)?;
        Ok(record)
    }

    /// Replace the fields of a record
    pub async fn update(&self, collection: &str, key: &str, fields: Fields) -> TillResult<Record> {
        validate_fields(&fields)?;
        let record = Record::new(key, fields);
        self.store.put(collection, &record)?;

        let pending = self.outbox.pending_action(collection, key)?;
        if pending.is_none() && !record.has_provisional_key() && self.connectivity.is_online() {
            match self.remote.update(collection, key, &record.fields).await {
                Ok(()) => return Ok(record),
                Err(e) => {
                    tracing::warn!(collection = %collection, key = %key, error = %e, "Remote update failed, queueing");
                }
            }
        }

        let action = match pending {
            Some(MutationAction::Create) => MutationAction::Create,
            _ if record.has_provisional_key() => MutationAction::Create,
            _ => MutationAction::Update,
        };
        self.outbox.enqueue(action, collection, &record)?;
        Ok(record)
    }

    /// Delete a record. Fails with `NotFound` if it is not stored locally.
    pub async fn delete(&self, collection: &str, key: &str) -> TillResult<()> {
        let existing = self
            .store
            .get(collection, key)?
            .ok_or_else(|| TillError::record_not_found(collection, key))?;

        let pending = self.outbox.pending_action(collection, key)?;
        self.store.delete(collection, key)?;

        if pending == Some(MutationAction::Create) {
            self.outbox.remove(&outbox_key(collection, key))?;
            tracing::debug!(collection = %collection, key = %key, "Dropped queued create");
            return Ok(());
        }
        if existing.has_provisional_key() {
            return Ok(());
        }

        if pending.is_none() && self.connectivity.is_online() {
            match self.remote.delete(collection, key).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => return Ok(()),
                Err(e) => {
                    tracing::warn!(collection = %collection, key = %key, error = %e, "Remote delete failed, queueing");
                }
            }
        }

        self.outbox
            .enqueue(MutationAction::Delete, collection, &existing)?;
        Ok(())
    }

    /// List a collection.
    ///
    /// Online, the remote snapshot is merged with local records that are not
    /// yet confirmed synced; local copies found to be already synced are
    /// purged and the cache is refreshed. Offline, or if the remote cannot be
    /// listed, the local records are returned.
    pub async fn list<F>(&self, collection: &str, same_object: F) -> TillResult<Vec<Record>>
    where
        F: Fn(&Record, &Record) -> bool,
    {
        let local = self.store.get_all(collection)?;
        if !self.connectivity.is_online() {
            return Ok(local);
        }

        let remote = match self.remote.list(collection).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Remote list failed, serving local records");
                return Ok(local);
            }
        };

        let pending: HashMap<String, MutationAction> = self
            .outbox
            .drain()?
            .into_iter()
            .filter(|m| m.collection == collection)
            .map(|m| (m.record.key, m.action))
            .collect();
        let remote_keys: HashSet<&str> = remote.iter().map(|r| r.key.as_str()).collect();

        let mut unsynced = Vec::new();
        let mut overrides = HashMap::new();
        let mut stale = Vec::new();
        for record in local {
            let in_remote = remote_keys.contains(record.key.as_str());
            match pending.get(&record.key) {
                Some(_) if in_remote => {
                    overrides.insert(record.key.clone(), record);
                }
                Some(_) => unsynced.push(record),
                None if record.has_provisional_key() => unsynced.push(record),
                // Confirmed once, now gone remotely
                None if !in_remote => stale.push(record.key),
                None => {}
            }
        }

        let remote_view: Vec<Record> = remote
            .into_iter()
            .filter_map(|r| match pending.get(&r.key) {
                Some(MutationAction::Delete) => None,
                Some(_) => Some(overrides.remove(&r.key).unwrap_or(r)),
                None => Some(r),
            })
            .collect();

        let outcome = merge(remote_view.clone(), unsynced, same_object);

        for key in &outcome.redundant_local {
            if pending.get(key) == Some(&MutationAction::Create) {
                self.outbox.remove(&outbox_key(collection, key))?;
            }
        }
        stale.extend(outcome.redundant_local.iter().cloned());
        let purged = self.store.purge(collection, &stale)?;
        if purged > 0 {
            tracing::info!(collection = %collection, purged, "Purged redundant local records");
        }
        self.store.put_many(collection, &remote_view)?;

        Ok(outcome.records)
    }
}
