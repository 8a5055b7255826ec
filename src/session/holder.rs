//! Startup wiring: backend selection, recovery, and scanner lifecycle.
//!
//! `SessionHolder::init` is the one place a coordinator process assembles
//! the session core. Recovery replay completes inside `init`, so by the
//! time a holder exists there is no partially-rebuilt index anything could
//! observe.

use std::sync::Arc;

use crate::config::{StoreConfig, StoreMode};
use crate::coordinator::Coordinator;
use crate::lock::LockRegistry;
use crate::session::SessionManager;
use crate::storage::{FileTransactionStoreManager, TimeoutScanner, TransactionStoreManager};
use crate::{JunctionError, Result};

/// Owner of the wired-up session core
pub struct SessionHolder {
    manager: Arc<SessionManager>,
    store: Arc<FileTransactionStoreManager>,
    locks: Arc<LockRegistry>,
    scanner: Option<TimeoutScanner>,
}

impl std::fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHolder")
            .field("scanner_running", &self.scanner.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionHolder {
    /// Wire the configured backend, replay the durable log, and start the
    /// timeout scanner.
    ///
    /// Only the file backend lives in this crate; the db/redis/raft modes
    /// are recognized configuration values wired elsewhere. Unknown mode
    /// names already failed when the configuration was parsed.
    pub fn init(config: &StoreConfig) -> Result<Self> {
        match config.mode {
            StoreMode::File => {}
            other => return Err(JunctionError::StoreModeUnsupported(other)),
        }

        let store = Arc::new(FileTransactionStoreManager::new(config)?);
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&store) as Arc<dyn TransactionStoreManager>
        ));
        store.attach_session_manager(&manager);

        // Recovery must finish before any traffic is accepted
        manager.reload()?;
        log::info!(
            "session store ready: {} sessions recovered from {}",
            manager.session_count(),
            config.dir.display()
        );

        let scanner = if config.scanner_enabled {
            Some(TimeoutScanner::start(
                Arc::clone(&store),
                config.timeout_check_interval,
            )?)
        } else {
            None
        };

        Ok(Self {
            manager,
            store,
            locks: Arc::new(LockRegistry::new()),
            scanner,
        })
    }

    /// The recovered session manager
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// The underlying file store
    pub fn store(&self) -> &Arc<FileTransactionStoreManager> {
        &self.store
    }

    /// The row-lock registry
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// A coordinator front door over this holder's core
    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(Arc::clone(&self.manager), Arc::clone(&self.locks))
    }

    /// Stop the scanner and flush the store
    pub fn destroy(mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.stop();
        }
        self.store.shutdown();
    }
}
