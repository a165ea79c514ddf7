//! Client facade wiring the services together.
//!
//! Holds one database handle shared by the Local Store and the outbox, the
//! connectivity oracle the platform layer reports into, the sync engine and
//! the repository the application writes through.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::{Config, SyncConfig};
use crate::connectivity::ConnectivityOracle;
use crate::database::Database;
use crate::error::{TillError, TillResult};
use crate::local_store::LocalStore;
use crate::outbox::Outbox;
use crate::remote::{HttpRemote, RemoteStore};
use crate::repository::Repository;
use crate::sync_engine::SyncEngine;

pub struct TillClient<R> {
    db: Arc<Mutex<Database>>,
    connectivity: Arc<ConnectivityOracle>,
    engine: Arc<SyncEngine<R>>,
    repository: Repository<R>,
}

impl TillClient<HttpRemote> {
    /// Open the configured database and connect to the configured remote
    pub fn open(config: &Config, initially_online: bool) -> TillResult<Self> {
        let remote = HttpRemote::new(config.remote_config())?;
        let db = Database::new(config.database_file(), config.collections())?;
        tracing::info!(
            database = %config.database_file(),
            remote = %remote.base_url(),
            "Opened sync client"
        );
        Ok(Self::with_remote(
            db,
            Arc::new(remote),
            config.sync_config(),
            initially_online,
        ))
    }
}

impl<R: RemoteStore + 'static> TillClient<R> {
    /// Assemble a client around an already opened database
    pub fn with_remote(
        db: Database,
        remote: Arc<R>,
        sync: &SyncConfig,
        initially_online: bool,
    ) -> Self {
        let db = Arc::new(Mutex::new(db));
        let store = LocalStore::new(db.clone());
        let outbox = Outbox::new(db.clone());
        let connectivity = Arc::new(ConnectivityOracle::new(initially_online));

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            outbox.clone(),
            remote.clone(),
            connectivity.clone(),
            sync.clone(),
        ));
        let repository = Repository::new(store, outbox, remote, connectivity.clone(), sync);

        Self {
            db,
            connectivity,
            engine,
            repository,
        }
    }

    pub fn repository(&self) -> &Repository<R> {
        &self.repository
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityOracle> {
        &self.connectivity
    }

    /// Platform hook for reachability changes
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// Start draining on reconnect. Must be called within a Tokio runtime.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.engine.spawn_reconnect_listener()
    }

    /// Close the database. Fails if a reconnect listener still holds the
    /// engine; abort and await it first.
    pub fn close(self) -> TillResult<()> {
        let Self {
            db,
            engine,
            repository,
            ..
        } = self;
        drop(repository);
        drop(engine);

        let db = Arc::try_unwrap(db)
            .map_err(|_| TillError::database_op("database is still in use"))?;
        let db = db
            .into_inner()
            .map_err(|_| TillError::database_op("database lock poisoned"))?;
        db.close()
    }
}
