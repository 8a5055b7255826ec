//! Coordinator entry points consumed by the RPC layer.
//!
//! These are the only paths through which resource managers reach the
//! session core: branch registration, branch status reports, and lock
//! queries, plus the global lifecycle transitions the coordination layer
//! drives. The core never calls out to resource managers itself.

use std::sync::Arc;

use crate::lock::LockRegistry;
use crate::session::{
    next_session_id, BranchSession, BranchStatus, BranchType, GlobalSession, GlobalStatus,
    SessionManager,
};
use crate::{JunctionError, Result};

/// Front door of the session core
pub struct Coordinator {
    sessions: Arc<SessionManager>,
    locks: Arc<LockRegistry>,
}

impl Coordinator {
    pub fn new(sessions: Arc<SessionManager>, locks: Arc<LockRegistry>) -> Self {
        Self { sessions, locks }
    }

    /// The session manager behind this coordinator
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The lock registry behind this coordinator
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Open a new global transaction; returns its xid
    pub fn begin(
        &self,
        application_id: &str,
        transaction_service_group: &str,
        transaction_name: &str,
        timeout_ms: u32,
    ) -> Result<String> {
        let session = GlobalSession::begin(
            application_id,
            transaction_service_group,
            transaction_name,
            timeout_ms,
        );
        let xid = session.xid.clone();
        self.sessions.add_global_session(session)?;
        log::debug!("began global transaction {xid}, timeout {timeout_ms}ms");
        Ok(xid)
    }

    /// Register a branch against a global transaction.
    ///
    /// Acquires every row lock named by `lock_keys` all-or-nothing before
    /// the branch is durably recorded; if the durable write then fails, the
    /// rows granted here are handed back so no partial lock survives.
    pub fn branch_register(
        &self,
        branch_type: BranchType,
        resource_id: &str,
        client_id: &str,
        xid: &str,
        application_data: &[u8],
        lock_keys: &str,
    ) -> Result<u64> {
        let session = self
            .sessions
            .find_global_session(xid)
            .ok_or_else(|| JunctionError::SessionNotFound(xid.to_string()))?;
        if session.status != GlobalStatus::Begin {
            return Err(JunctionError::IllegalSessionStatus {
                xid: xid.to_string(),
                status: session.status,
            });
        }

        let branch_id = next_session_id();
        let granted = self.locks.acquire(xid, branch_id, resource_id, lock_keys)?;

        let branch = BranchSession::new(
            xid,
            session.transaction_id,
            branch_id,
            resource_id,
            branch_type,
            lock_keys,
            client_id,
            application_data.to_vec(),
        );
        if let Err(e) = self.sessions.add_branch_session(xid, branch) {
            self.locks.release_rows(&granted);
            return Err(e);
        }
        log::debug!("registered branch {branch_id} of {xid} on {resource_id}");
        Ok(branch_id)
    }

    /// Apply a branch outcome report from a resource manager
    pub fn branch_report(
        &self,
        _branch_type: BranchType,
        xid: &str,
        branch_id: u64,
        status: BranchStatus,
        application_data: Option<Vec<u8>>,
    ) -> Result<()> {
        self.sessions
            .update_branch_session_status(xid, branch_id, status, application_data)
    }

    /// Whether every row named by `lock_keys` is free or already owned by
    /// the querying global transaction
    pub fn lock_query(
        &self,
        _branch_type: BranchType,
        resource_id: &str,
        xid: &str,
        lock_keys: &str,
    ) -> Result<bool> {
        self.locks.is_lockable(resource_id, xid, lock_keys)
    }

    /// Drive a global status transition (the coordination layer's path for
    /// commit/rollback progress)
    pub fn update_global_status(&self, xid: &str, status: GlobalStatus) -> Result<()> {
        self.sessions.update_global_session_status(xid, status)
    }

    /// Finish a global transaction: durably record the terminal status,
    /// release every row lock it holds, and purge it from the store. Lock
    /// release is part of this one transition, never a separate step.
    pub fn end_global(&self, xid: &str, status: GlobalStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(JunctionError::IllegalSessionStatus {
                xid: xid.to_string(),
                status,
            });
        }
        self.sessions.update_global_session_status(xid, status)?;
        let released = self.locks.release_xid(xid);
        self.sessions.remove_global_session(xid)?;
        log::debug!("ended global transaction {xid} as {status:?}, released {released} row locks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{FileTransactionStoreManager, TransactionStoreManager};
    use std::path::Path;
    use tempfile::tempdir;

    fn open_coordinator(dir: &Path) -> (Coordinator, Arc<FileTransactionStoreManager>) {
        let config = StoreConfig {
            dir: dir.to_path_buf(),
            ..StoreConfig::default()
        };
        let store = Arc::new(FileTransactionStoreManager::new(&config).unwrap());
        let sessions = Arc::new(SessionManager::new(store.clone()));
        store.attach_session_manager(&sessions);
        sessions.reload().unwrap();
        (Coordinator::new(sessions, Arc::new(LockRegistry::new())), store)
    }

    #[test]
    fn test_register_report_end_flow() {
        let dir = tempdir().unwrap();
        let (coordinator, store) = open_coordinator(dir.path());

        let xid = coordinator.begin("order-svc", "default_tx_group", "create-order", 60_000).unwrap();
        let branch_a = coordinator
            .branch_register(BranchType::At, "db1", "rm-1", &xid, b"undo-a", "orders:1")
            .unwrap();
        let branch_b = coordinator
            .branch_register(BranchType::At, "db1", "rm-1", &xid, b"undo-b", "stock:1")
            .unwrap();
        assert_ne!(branch_a, branch_b);

        coordinator
            .branch_report(BranchType::At, &xid, branch_a, BranchStatus::PhaseOneDone, None)
            .unwrap();

        let session = coordinator.session_manager().find_global_session(&xid).unwrap();
        assert_eq!(session.branch_sessions.len(), 2);
        assert_eq!(session.branch_sessions[0].status, BranchStatus::PhaseOneDone);
        assert_eq!(coordinator.lock_registry().held_count(), 2);

        coordinator.update_global_status(&xid, GlobalStatus::Committing).unwrap();
        coordinator.end_global(&xid, GlobalStatus::Committed).unwrap();

        assert!(coordinator.session_manager().find_global_session(&xid).is_none());
        assert_eq!(coordinator.lock_registry().held_count(), 0);
        store.shutdown();
        drop(coordinator);
        drop(store);

        // Nothing survives a reload either
        let (coordinator, _store) = open_coordinator(dir.path());
        assert_eq!(coordinator.session_manager().session_count(), 0);
    }

    #[test]
    fn test_conflicting_branches_from_two_globals() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());

        let xid_1 = coordinator.begin("svc-a", "g", "t1", 60_000).unwrap();
        let xid_2 = coordinator.begin("svc-b", "g", "t2", 60_000).unwrap();

        coordinator
            .branch_register(BranchType::At, "db1", "rm-1", &xid_1, b"", "orders:1,2")
            .unwrap();
        let err = coordinator
            .branch_register(BranchType::At, "db1", "rm-2", &xid_2, b"", "orders:2,3")
            .unwrap_err();
        assert!(matches!(err, JunctionError::LockConflict { .. }));

        // The loser registered nothing and holds nothing
        let session = coordinator.session_manager().find_global_session(&xid_2).unwrap();
        assert!(session.branch_sessions.is_empty());
        assert!(coordinator.lock_registry().is_lockable("db1", &xid_1, "orders:3").unwrap());
        assert!(!coordinator.lock_query(BranchType::At, "db1", &xid_2, "orders:2").unwrap());
    }

    #[test]
    fn test_register_requires_begin_status() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());

        let xid = coordinator.begin("svc", "g", "t", 60_000).unwrap();
        coordinator.update_global_status(&xid, GlobalStatus::Committing).unwrap();

        let err = coordinator
            .branch_register(BranchType::Tcc, "db1", "rm-1", &xid, b"", "")
            .unwrap_err();
        assert!(matches!(err, JunctionError::IllegalSessionStatus { .. }));
    }

    #[test]
    fn test_register_against_unknown_xid() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());
        let err = coordinator
            .branch_register(BranchType::At, "db1", "rm-1", "ghost:1", b"", "")
            .unwrap_err();
        assert!(matches!(err, JunctionError::SessionNotFound(_)));
    }

    #[test]
    fn test_report_against_unknown_branch() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());
        let xid = coordinator.begin("svc", "g", "t", 60_000).unwrap();
        let err = coordinator
            .branch_report(BranchType::At, &xid, 424242, BranchStatus::PhaseOneDone, None)
            .unwrap_err();
        assert!(matches!(err, JunctionError::BranchNotFound { .. }));
    }

    #[test]
    fn test_end_global_requires_terminal_status() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());
        let xid = coordinator.begin("svc", "g", "t", 60_000).unwrap();
        let err = coordinator.end_global(&xid, GlobalStatus::Committing).unwrap_err();
        assert!(matches!(err, JunctionError::IllegalSessionStatus { .. }));
    }

    #[test]
    fn test_tcc_branch_without_lock_keys() {
        let dir = tempdir().unwrap();
        let (coordinator, _store) = open_coordinator(dir.path());
        let xid = coordinator.begin("svc", "g", "t", 60_000).unwrap();
        coordinator
            .branch_register(BranchType::Tcc, "tcc-action", "rm-1", &xid, b"try-ctx", "")
            .unwrap();
        assert_eq!(coordinator.lock_registry().held_count(), 0);
    }
}
