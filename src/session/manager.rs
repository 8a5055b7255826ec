//! In-memory session index, rebuilt from the durable log on startup.
//!
//! Every mutation entry point follows the same two-step contract:
//!
//! 1. append the durable log record — must succeed first;
//! 2. apply the change to the in-memory index.
//!
//! A crash between the two steps is harmless: replaying the log reproduces
//! the post-log state, and the persisted state is never behind what a
//! concurrent reader could have observed in memory.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};

use crate::session::branch::{BranchSession, BranchStatus};
use crate::session::global::{now_millis, GlobalSession, GlobalStatus};
use crate::storage::{LogOperation, SessionPayload, TransactionStoreManager, TransactionWriteStore};
use crate::{JunctionError, Result};

/// Records folded per batch during replay, bounding reload memory
const RELOAD_BATCH_SIZE: usize = 100;

type SessionHandle = Arc<Mutex<GlobalSession>>;

/// Shared in-memory index of all live sessions.
///
/// Mutations are serialized per global session by the session's own mutex;
/// operations on different transactions proceed in parallel. The index maps
/// themselves are only held long enough to resolve a handle.
pub struct SessionManager {
    store: Arc<dyn TransactionStoreManager>,
    sessions: RwLock<AHashMap<u64, SessionHandle>>,
    xid_index: RwLock<AHashMap<String, u64>>,
    status_index: RwLock<AHashMap<GlobalStatus, AHashSet<u64>>>,
}

impl SessionManager {
    /// Create an empty manager over the given store
    pub fn new(store: Arc<dyn TransactionStoreManager>) -> Self {
        Self {
            store,
            sessions: RwLock::new(AHashMap::new()),
            xid_index: RwLock::new(AHashMap::new()),
            status_index: RwLock::new(AHashMap::new()),
        }
    }

    /// The store this manager persists through
    pub fn store(&self) -> &Arc<dyn TransactionStoreManager> {
        &self.store
    }

    // ========================================================================
    // Mutations (write log, then mutate memory)
    // ========================================================================

    /// Register a new global session
    pub fn add_global_session(&self, session: GlobalSession) -> Result<()> {
        // Step 1: durable record
        self.store.write_session(
            LogOperation::GlobalAdd,
            &SessionPayload::Global(session.clone_header()),
        )?;

        // Step 2: memory
        let transaction_id = session.transaction_id;
        let status = session.status;
        let xid = session.xid.clone();
        self.sessions
            .write()
            .insert(transaction_id, Arc::new(Mutex::new(session)));
        self.xid_index.write().insert(xid, transaction_id);
        self.index_status(transaction_id, None, status);
        Ok(())
    }

    /// Transition a global session to a new status
    pub fn update_global_session_status(&self, xid: &str, status: GlobalStatus) -> Result<()> {
        let handle = self.handle_by_xid(xid)?;
        let mut session = handle.lock();
        if session.status.is_terminal() {
            return Err(JunctionError::SessionTerminal {
                xid: xid.to_string(),
                status: session.status,
            });
        }

        // Step 1: durable record
        let mut header = session.clone_header();
        header.status = status;
        self.store
            .write_session(LogOperation::GlobalUpdate, &SessionPayload::Global(header))?;

        // Step 2: memory
        let old = session.status;
        let transaction_id = session.transaction_id;
        session.status = status;
        drop(session);
        self.index_status(transaction_id, Some(old), status);
        Ok(())
    }

    /// Remove a global session from the store and the index
    pub fn remove_global_session(&self, xid: &str) -> Result<()> {
        let handle = self.handle_by_xid(xid)?;
        let session = handle.lock();

        // Step 1: durable record
        self.store.write_session(
            LogOperation::GlobalRemove,
            &SessionPayload::Global(session.clone_header()),
        )?;

        // Step 2: memory
        let transaction_id = session.transaction_id;
        let status = session.status;
        drop(session);
        self.sessions.write().remove(&transaction_id);
        self.xid_index.write().remove(xid);
        self.unindex_status(transaction_id, status);
        Ok(())
    }

    /// Attach a newly registered branch to its global session
    pub fn add_branch_session(&self, xid: &str, branch: BranchSession) -> Result<()> {
        let handle = self.handle_by_xid(xid)?;
        let mut session = handle.lock();
        if session.status.is_terminal() {
            return Err(JunctionError::SessionTerminal {
                xid: xid.to_string(),
                status: session.status,
            });
        }
        if session.branch(branch.branch_id).is_some() {
            // Logic error, refused before any write
            return Err(JunctionError::BranchAlreadyExists {
                xid: xid.to_string(),
                branch_id: branch.branch_id,
            });
        }

        // Step 1: durable record
        self.store
            .write_session(LogOperation::BranchAdd, &SessionPayload::Branch(branch.clone()))?;

        // Step 2: memory (duplicate check already done above)
        session.add_branch(branch)
    }

    /// Apply a branch status report
    pub fn update_branch_session_status(
        &self,
        xid: &str,
        branch_id: u64,
        status: BranchStatus,
        application_data: Option<Vec<u8>>,
    ) -> Result<()> {
        let handle = self.handle_by_xid(xid)?;
        let mut session = handle.lock();
        if session.status.is_terminal() {
            return Err(JunctionError::SessionTerminal {
                xid: xid.to_string(),
                status: session.status,
            });
        }
        let Some(branch) = session.branch(branch_id) else {
            return Err(JunctionError::BranchNotFound {
                xid: xid.to_string(),
                branch_id,
            });
        };

        // Step 1: durable record carrying the post-update branch
        let mut updated = branch.clone();
        updated.status = status;
        if let Some(data) = &application_data {
            updated.application_data = data.clone();
        }
        self.store
            .write_session(LogOperation::BranchUpdate, &SessionPayload::Branch(updated))?;

        // Step 2: memory
        let branch = session
            .branch_mut(branch_id)
            .expect("branch existed under the same session lock");
        branch.status = status;
        if let Some(data) = application_data {
            branch.application_data = data;
        }
        Ok(())
    }

    /// Detach a branch from its global session
    pub fn remove_branch_session(&self, xid: &str, branch_id: u64) -> Result<()> {
        let handle = self.handle_by_xid(xid)?;
        let mut session = handle.lock();
        let Some(branch) = session.branch(branch_id) else {
            return Err(JunctionError::BranchNotFound {
                xid: xid.to_string(),
                branch_id,
            });
        };

        // Step 1: durable record
        self.store
            .write_session(LogOperation::BranchRemove, &SessionPayload::Branch(branch.clone()))?;

        // Step 2: memory
        session.remove_branch(branch_id);
        Ok(())
    }

    // ========================================================================
    // Reads (snapshot semantics)
    // ========================================================================

    /// Look up a global session by xid
    pub fn find_global_session(&self, xid: &str) -> Option<GlobalSession> {
        let transaction_id = *self.xid_index.read().get(xid)?;
        self.session_by_transaction_id(transaction_id)
    }

    /// Look up a global session by transaction id
    pub fn session_by_transaction_id(&self, transaction_id: u64) -> Option<GlobalSession> {
        let handle = self.sessions.read().get(&transaction_id)?.clone();
        let session = handle.lock();
        Some(session.clone())
    }

    /// Snapshot of every session in the index
    pub fn all_sessions(&self) -> Vec<GlobalSession> {
        self.find_global_sessions(|_| true)
    }

    /// Snapshot of every session matching the predicate
    pub fn find_global_sessions<F>(&self, predicate: F) -> Vec<GlobalSession>
    where
        F: Fn(&GlobalSession) -> bool,
    {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        handles
            .iter()
            .filter_map(|handle| {
                let session = handle.lock();
                predicate(&session).then(|| session.clone())
            })
            .collect()
    }

    /// Number of sessions in the index
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    // ========================================================================
    // Store-facing handle access
    // ========================================================================

    fn handle_by_xid(&self, xid: &str) -> Result<SessionHandle> {
        let transaction_id = *self
            .xid_index
            .read()
            .get(xid)
            .ok_or_else(|| JunctionError::SessionNotFound(xid.to_string()))?;
        self.sessions
            .read()
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| JunctionError::SessionNotFound(xid.to_string()))
    }

    /// Handles of every indexed session, for the rollover checkpoint pass
    pub(crate) fn session_handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    /// Handles of sessions that look timed out right now. Callers must
    /// re-validate under each session's lock before acting: the scan is a
    /// snapshot and sessions transition concurrently.
    pub(crate) fn timed_out_handles(&self, now_ms: u64) -> Vec<SessionHandle> {
        let candidate_ids: Vec<u64> = {
            let status_index = self.status_index.read();
            status_index
                .iter()
                .filter(|(status, _)| !status.is_terminal())
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };
        let sessions = self.sessions.read();
        candidate_ids
            .into_iter()
            .filter_map(|id| sessions.get(&id).cloned())
            .filter(|handle| handle.lock().is_timed_out(now_ms))
            .collect()
    }

    fn index_status(&self, transaction_id: u64, old: Option<GlobalStatus>, new: GlobalStatus) {
        let mut status_index = self.status_index.write();
        if let Some(old) = old {
            if let Some(ids) = status_index.get_mut(&old) {
                ids.remove(&transaction_id);
            }
        }
        status_index.entry(new).or_default().insert(transaction_id);
    }

    fn unindex_status(&self, transaction_id: u64, status: GlobalStatus) {
        if let Some(ids) = self.status_index.write().get_mut(&status) {
            ids.remove(&transaction_id);
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild the index by folding the durable log, history segment first.
    ///
    /// Must complete before the coordinator serves any traffic; callers go
    /// through [`SessionHolder::init`](crate::session::SessionHolder) which
    /// enforces that ordering.
    pub fn reload(&self) -> Result<()> {
        for is_history in [true, false] {
            loop {
                let batch = self.store.read_write_store(RELOAD_BATCH_SIZE, is_history)?;
                if batch.is_empty() {
                    break;
                }
                for record in batch {
                    self.apply_record(record);
                }
            }
        }
        self.purge_terminal_sessions();
        self.rebuild_status_index();
        Ok(())
    }

    /// Apply one replayed record to the in-memory state. Replay never writes
    /// back to the store.
    fn apply_record(&self, record: TransactionWriteStore) {
        match (record.operation, record.session) {
            (LogOperation::GlobalAdd, SessionPayload::Global(global)) => {
                let transaction_id = global.transaction_id;
                let xid = global.xid.clone();
                let mut sessions = self.sessions.write();
                match sessions.get(&transaction_id) {
                    // A checkpoint re-anchors an existing session: replace
                    // it wholesale, branch records follow in the log
                    Some(handle) => *handle.lock() = global,
                    None => {
                        sessions.insert(transaction_id, Arc::new(Mutex::new(global)));
                    }
                }
                drop(sessions);
                self.xid_index.write().insert(xid, transaction_id);
            }
            (LogOperation::GlobalUpdate, SessionPayload::Global(global)) => {
                match self.sessions.read().get(&global.transaction_id) {
                    Some(handle) => handle.lock().status = global.status,
                    None => log::warn!(
                        "replay: status update for unknown global session {} dropped",
                        global.xid
                    ),
                }
            }
            (LogOperation::GlobalRemove, SessionPayload::Global(global)) => {
                self.sessions.write().remove(&global.transaction_id);
                self.xid_index.write().remove(&global.xid);
            }
            (LogOperation::BranchAdd, SessionPayload::Branch(branch)) => {
                let Some(handle) = self.sessions.read().get(&branch.transaction_id).cloned() else {
                    // Orphaned branch: the parent's records were checkpointed
                    // away before this segment was written
                    log::warn!(
                        "replay: branch {} references missing global session {}; dropped",
                        branch.branch_id,
                        branch.xid
                    );
                    return;
                };
                let mut session = handle.lock();
                match session.branch_mut(branch.branch_id) {
                    Some(existing) => *existing = branch,
                    None => session.branch_sessions.push(branch),
                }
            }
            (LogOperation::BranchUpdate, SessionPayload::Branch(branch)) => {
                let Some(handle) = self.sessions.read().get(&branch.transaction_id).cloned() else {
                    log::warn!(
                        "replay: branch update for missing global session {} dropped",
                        branch.xid
                    );
                    return;
                };
                let mut session = handle.lock();
                match session.branch_mut(branch.branch_id) {
                    Some(existing) => *existing = branch,
                    None => log::warn!(
                        "replay: update for unknown branch {} of {} dropped",
                        branch.branch_id,
                        branch.xid
                    ),
                }
            }
            (LogOperation::BranchRemove, SessionPayload::Branch(branch)) => {
                if let Some(handle) = self.sessions.read().get(&branch.transaction_id).cloned() {
                    handle.lock().remove_branch(branch.branch_id);
                }
            }
            (operation, session) => {
                // Encoder refuses these pairings; seeing one means the log
                // was written by something else entirely
                log::warn!(
                    "replay: operation {operation:?} with mismatched body for {} dropped",
                    session.xid()
                );
            }
        }
    }

    /// Sessions whose terminal record made it to the log but whose remove
    /// record did not are finished business: drop them from the index.
    fn purge_terminal_sessions(&self) {
        let mut sessions = self.sessions.write();
        let mut xid_index = self.xid_index.write();
        sessions.retain(|_, handle| {
            let session = handle.lock();
            if session.status.is_terminal() {
                log::debug!("purging finished global session {} after replay", session.xid);
                xid_index.remove(&session.xid);
                false
            } else {
                true
            }
        });
    }

    fn rebuild_status_index(&self) {
        let sessions = self.sessions.read();
        let mut status_index = self.status_index.write();
        status_index.clear();
        for handle in sessions.values() {
            let session = handle.lock();
            status_index
                .entry(session.status)
                .or_default()
                .insert(session.transaction_id);
        }
    }

    /// Sessions currently timed out, as snapshots (for monitoring and tests)
    pub fn timed_out_sessions(&self) -> Vec<GlobalSession> {
        let now = now_millis();
        self.find_global_sessions(|s| s.is_timed_out(now))
    }
}
