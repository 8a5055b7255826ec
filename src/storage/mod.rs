//! Durable transaction store: log record model and storage backends.
//!
//! Every session mutation becomes one append-only log record; a session's
//! current state is the fold of all its records in log order. The store
//! itself is a dumb append/read primitive — replay and index rebuilding
//! belong to the session manager.

pub mod file_store;
pub mod record;
pub mod scanner;

pub use file_store::FileTransactionStoreManager;
pub use record::{SessionPayload, TransactionWriteStore};
pub use scanner::TimeoutScanner;

use crate::{JunctionError, Result};

// ============================================================================
// Log Operation
// ============================================================================

/// Mutation kind carried by a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOperation {
    GlobalAdd = 1,
    GlobalUpdate = 2,
    GlobalRemove = 3,
    BranchAdd = 4,
    BranchUpdate = 5,
    BranchRemove = 6,
}

impl LogOperation {
    /// Whether the record body is a global session (as opposed to a branch)
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            LogOperation::GlobalAdd | LogOperation::GlobalUpdate | LogOperation::GlobalRemove
        )
    }
}

impl TryFrom<u8> for LogOperation {
    type Error = JunctionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogOperation::GlobalAdd),
            2 => Ok(LogOperation::GlobalUpdate),
            3 => Ok(LogOperation::GlobalRemove),
            4 => Ok(LogOperation::BranchAdd),
            5 => Ok(LogOperation::BranchUpdate),
            6 => Ok(LogOperation::BranchRemove),
            other => Err(JunctionError::InvalidLogOperation(other)),
        }
    }
}

// ============================================================================
// Store Contract
// ============================================================================

/// Contract every session store backend implements.
///
/// One implementing type per configured backend; the file backend in this
/// crate is the reference implementation.
pub trait TransactionStoreManager: Send + Sync {
    /// Append one log record. The append must be atomic with respect to the
    /// append point: a crash mid-write may truncate the tail but never
    /// corrupts records already on disk.
    fn write_session(&self, operation: LogOperation, session: &SessionPayload) -> Result<()>;

    /// Read the next batch of records from the store's sequential cursor.
    /// `read_size` bounds the number of records returned per call so replay
    /// of very large logs stays memory-bounded. `is_history` selects the
    /// rolled history file over the active log.
    fn read_write_store(
        &self,
        read_size: usize,
        is_history: bool,
    ) -> Result<Vec<TransactionWriteStore>>;

    /// Whether the selected file still has unread bytes past the cursor
    fn has_remaining(&self, is_history: bool) -> bool;

    /// Flush buffered writes and release the backing file/connection
    fn shutdown(&self);
}
