//! Sync Engine: replays the outbox against the remote store.
//!
//! A drain pass walks a snapshot of the outbox in queue order. Each entry is
//! re-read before it is applied; an entry that was removed or superseded
//! since the snapshot is skipped and left for the next pass. A successful
//! replay removes the entry only if it is still the version that was sent.
//!
//! Remote failures stay at item level: the entry remains queued (or is
//! dead-lettered after too many attempts) and the pass moves on. Local Store
//! and Outbox failures abort the pass.
//!
//! Only one pass runs at a time. Reconnect events and explicit requests share
//! the same guarded entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityOracle;
use crate::error::{RemoteError, TillError, TillResult};
use crate::local_store::LocalStore;
use crate::models::{Mutation, MutationAction, Record, SyncPhase};
use crate::outbox::{FailureDisposition, Outbox};
use crate::remote::RemoteStore;
use crate::status::{StatusBroadcaster, SubscriptionId};

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Mutations applied remotely and removed from the outbox
    pub applied: usize,
    /// Mutations whose remote call failed (dead-lettered ones included)
    pub failed: usize,
    /// Mutations removed or superseded after the snapshot was taken
    pub skipped: usize,
    /// Mutations moved to the dead-letter table during this pass
    pub dead_lettered: usize,
    /// `outbox key: error` for each failure
    pub errors: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Result of a sync request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another pass was in progress; nothing was done
    AlreadyRunning,
    /// The client is offline; nothing was done
    Offline,
}

/// Clears the draining flag when a pass ends, including by panic
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<R> {
    store: LocalStore,
    outbox: Outbox,
    remote: Arc<R>,
    connectivity: Arc<ConnectivityOracle>,
    status: StatusBroadcaster,
    draining: AtomicBool,
    config: SyncConfig,
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
    pub fn new(
        store: LocalStore,
        outbox: Outbox,
        remote: Arc<R>,
        connectivity: Arc<ConnectivityOracle>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            outbox,
            remote,
            connectivity,
            status: StatusBroadcaster::new(),
            draining: AtomicBool::new(false),
            config,
        }
    }

    /// Whether a drain pass is running
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityOracle> {
        &self.connectivity
    }

    /// Receive `start`/`end` phases as a stream
    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncPhase> {
        self.status.subscribe()
    }

    /// Register a status callback
    pub fn on_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(SyncPhase) + Send + Sync + 'static,
    {
        self.status.on_status(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    /// Run a drain pass unless one is already running or the client is
    /// offline.
    pub async fn request_sync(&self) -> TillResult<DrainOutcome> {
        if !self.connectivity.is_online() {
            tracing::debug!("Sync requested while offline, skipping");
            return Ok(DrainOutcome::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.draining);

        self.status.emit(SyncPhase::Start);
        let result = self.drain_pass().await;
        self.status.emit(SyncPhase::End);

        match result {
            Ok(report) => {
                tracing::info!(
                    applied = report.applied,
                    failed = report.failed,
                    skipped = report.skipped,
                    dead_lettered = report.dead_lettered,
                    "Drain pass finished"
                );
                Ok(DrainOutcome::Completed(report))
            }
            Err(e) => {
                tracing::error!(error = %e, "Drain pass aborted");
                Err(e)
            }
        }
    }

    async fn drain_pass(&self) -> TillResult<DrainReport> {
        let snapshot = self.outbox.drain()?;
        tracing::debug!(pending = snapshot.len(), "Draining outbox");

        let mut report = DrainReport::default();
        for queued in snapshot {
            let mutation = match self.outbox.get(&queued.key)? {
                Some(current) if current.seq == queued.seq => current,
                _ => {
                    tracing::debug!(key = %queued.key, "Mutation changed since snapshot, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            match self.replay(&mutation).await {
                Ok(()) => report.applied += 1,
                Err(TillError::Remote(err)) => self.handle_failure(&mutation, err, &mut report)?,
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    async fn replay(&self, mutation: &Mutation) -> TillResult<()> {
        let collection = mutation.collection.as_str();
        let record = &mutation.record;

        match mutation.action {
            MutationAction::Create => {
                let assigned = self.remote.create(collection, &record.fields).await?;
                self.settle_create(mutation, &assigned)?;
            }
            MutationAction::Update => {
                self.remote
                    .update(collection, &record.key, &record.fields)
                    .await?;
                self.outbox.remove_if_current(&mutation.key, mutation.seq)?;
            }
            MutationAction::Delete => {
                match self.remote.delete(collection, &record.key).await {
                    Ok(()) => {}
                    Err(RemoteError::NotFound(_)) => {
                        tracing::debug!(key = %mutation.key, "Record already absent remotely");
                    }
                    Err(e) => return Err(e.into()),
                }
                self.outbox.remove_if_current(&mutation.key, mutation.seq)?;
            }
        }

        tracing::debug!(key = %mutation.key, action = %mutation.action, "Applied mutation");
        Ok(())
    }

    /// Retire the provisional key of a confirmed create
    fn settle_create(&self, mutation: &Mutation, assigned: &str) -> TillResult<()> {
        let collection = mutation.collection.as_str();
        let provisional = mutation.record.key.as_str();

        let local = self.store.get(collection, provisional)?;
        let pending = self.outbox.get(&mutation.key)?;

        match local {
            Some(local) if assigned != provisional => {
                self.store
                    .rekey(collection, provisional, &Record::new(assigned, local.fields))?;
            }
            Some(_) => {}
            None if pending.is_none() && self.store.get(collection, assigned)?.is_some() => {
                // A list refresh already matched the remote copy and
                // retired the provisional record
                tracing::debug!(
                    collection = %collection,
                    key = %assigned,
                    "Create already settled by reconciliation"
                );
                return Ok(());
            }
            None if pending.is_none() => {
                // Deleted locally while the create was in flight
                tracing::info!(
                    collection = %collection,
                    key = %assigned,
                    "Created record was deleted locally, queueing remote delete"
                );
                let orphan = Record::new(assigned, mutation.record.fields.clone());
                self.outbox
                    .enqueue(MutationAction::Delete, collection, &orphan)?;
                return Ok(());
            }
            None => {}
        }

        if !self.outbox.remove_if_current(&mutation.key, mutation.seq)? && assigned != provisional {
            // Written again while the create was in flight
            self.outbox.rekey(collection, provisional, assigned)?;
        }

        tracing::info!(
            collection = %collection,
            provisional = %provisional,
            key = %assigned,
            "Create confirmed"
        );
        Ok(())
    }

    fn handle_failure(
        &self,
        mutation: &Mutation,
        err: RemoteError,
        report: &mut DrainReport,
    ) -> TillResult<()> {
        let message = err.to_string();
        report.failed += 1;
        report.errors.push(format!("{}: {}", mutation.key, message));

        match self.outbox.record_failure(
            &mutation.key,
            mutation.seq,
            &message,
            self.config.max_attempts,
        )? {
            FailureDisposition::Retry { attempts } => {
                tracing::warn!(
                    key = %mutation.key,
                    attempts,
                    error = %message,
                    "Replay failed, mutation stays queued"
                );
            }
            FailureDisposition::DeadLettered { attempts } => {
                report.dead_lettered += 1;
                tracing::error!(
                    key = %mutation.key,
                    attempts,
                    error = %message,
                    "Replay failed too many times, mutation dead-lettered"
                );
            }
            FailureDisposition::Superseded => {
                tracing::debug!(key = %mutation.key, "Failed mutation was superseded");
            }
        }
        Ok(())
    }

    /// Drain whenever connectivity returns and holds for the configured
    /// debounce. Returns None if reconnect sync is disabled.
    ///
    /// Flaps within the debounce window coalesce into one pass. The task
    /// runs until aborted.
    pub fn spawn_reconnect_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.sync_on_reconnect {
            tracing::debug!("Reconnect sync disabled");
            return None;
        }

        let engine = Arc::clone(self);
        let mut events = engine.connectivity.subscribe();
        let debounce = Duration::from_millis(engine.config.reconnect_debounce_ms);

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }

                if !engine.connectivity.settle(debounce).await {
                    continue;
                }
                // Transitions that happened during the debounce are covered
                // by this pass
                loop {
                    match events.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                        Err(_) => break,
                    }
                }

                match engine.request_sync().await {
                    Ok(DrainOutcome::Completed(report)) if !report.is_clean() => {
                        tracing::warn!(failed = report.failed, "Reconnect sync left mutations queued");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Reconnect sync failed"),
                }
            }
        }))
    }
}
