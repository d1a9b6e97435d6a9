use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use server::server_error::ServerError;
use server::server_manager::ServerManager;

use crate::config::cfg::Cfg;
use crate::credential_store::store::CredentialStore;
use crate::request_handler::handler::TrackerRequestHandler;
use crate::session_registry::registry::{AtomicSessionRegistry, SessionRegistryError};

/// The tracker itself: credential store, session registry and the
/// server manager that feeds them requests.
///
/// Serves as the starting point for the application.
pub struct FsTracker {
    server: ServerManager,
    registry: Arc<AtomicSessionRegistry>,
    store: Arc<CredentialStore>,
}

/// Possible tracker errors.
#[derive(Debug)]
pub enum FsTrackerError {
    /// The credential store could not be created or repaired.
    StoreNotUsable,
    CreatingServerError(ServerError),
    ServerError(ServerError),
    RegistryError(SessionRegistryError),
}

impl FsTracker {
    /// Repairs the store, builds the registry and starts serving.
    pub fn start(config: Cfg) -> Result<Self, FsTrackerError> {
        let store = Arc::new(CredentialStore::open(Path::new(&config.store_path)));
        if !store.fix_schema() {
            return Err(FsTrackerError::StoreNotUsable);
        }

        let registry = Arc::new(AtomicSessionRegistry::default());
        let handler = Arc::new(TrackerRequestHandler::new(
            registry.clone(),
            store.clone(),
            config.clone(),
        ));

        let server = ServerManager::start(
            &format!("0.0.0.0:{}", config.tcp_port),
            handler,
            Duration::from_millis(config.cleaning_interval_ms),
        )
        .map_err(FsTrackerError::CreatingServerError)?;

        info!("tracker started on {}", server.local_addr());

        Ok(Self {
            server,
            registry,
            store,
        })
    }

    /// The effective listening address (useful when the configured port
    /// was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn active_workers(&self) -> Result<usize, FsTrackerError> {
        self.server
            .active_workers()
            .map_err(FsTrackerError::ServerError)
    }

    pub fn session_count(&self) -> Result<usize, FsTrackerError> {
        self.registry
            .session_count()
            .map_err(FsTrackerError::RegistryError)
    }

    pub fn registry(&self) -> &Arc<AtomicSessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Stops accepting, lets in-flight requests finish, then shuts the
    /// cleaner down.
    pub fn drain(&mut self) -> Result<(), FsTrackerError> {
        self.server.drain().map_err(FsTrackerError::ServerError)
    }

    /// Forced close of the listener and every live connection.
    pub fn stop(&mut self) -> Result<(), FsTrackerError> {
        self.server.stop().map_err(FsTrackerError::ServerError)
    }
}
