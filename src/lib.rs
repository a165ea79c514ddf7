//! TillSync - offline-first synchronization engine for point-of-sale clients.
//!
//! This library keeps a client usable without connectivity:
//! - Local Store: durable per-collection record cache (SQLite)
//! - Mutation Outbox: ordered, collapsing log of pending writes
//! - Connectivity Oracle: platform-reported online state and reconnect events
//! - Sync Engine: replays the outbox and remaps provisional keys
//! - Reconciliation: duplicate-free merge of remote and local records
//!
//! The remote document store is reached through the [`RemoteStore`] trait;
//! [`HttpRemote`] implements it over HTTP.
//!
//! # Feature Flags
//!
//! - `desktop`: Default config directory detection.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod database;
pub mod error;
pub mod local_store;
pub mod models;
pub mod outbox;
pub mod reconcile;
pub mod remote;
pub mod repository;
pub mod status;
pub mod sync_engine;
pub mod validation;

// Re-export commonly used types
pub use client::TillClient;
pub use config::Config;
pub use connectivity::ConnectivityOracle;
pub use database::Database;
pub use error::{RemoteError, TillError, TillResult};
pub use local_store::LocalStore;
pub use models::{Fields, Mutation, MutationAction, Record, SyncPhase};
pub use outbox::Outbox;
pub use reconcile::{match_fields, merge, MergeOutcome};
pub use remote::{HttpRemote, RemoteStore};
pub use repository::Repository;
pub use sync_engine::{DrainOutcome, DrainReport, SyncEngine};
