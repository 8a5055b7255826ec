//! Junction Transaction Coordinator Core
//!
//! The durable session store at the heart of a distributed-transaction
//! coordinator. Tracks the lifecycle of global transactions and their
//! resource branches, persists every state change to an append-only log
//! before it becomes visible in memory, and rebuilds the in-memory view
//! from that log after a crash or restart.

pub mod config;
pub mod coordinator;
pub mod lock;
pub mod session;
pub mod storage;

// Re-export main types
pub use config::{StoreConfig, StoreMode};
pub use coordinator::Coordinator;
pub use lock::LockRegistry;
pub use session::{
    BranchSession, BranchStatus, BranchType, GlobalSession, GlobalStatus, LockStatus,
    SessionHolder, SessionManager,
};
pub use storage::{
    FileTransactionStoreManager, LogOperation, SessionPayload, TimeoutScanner,
    TransactionStoreManager, TransactionWriteStore,
};

/// Coordinator core error type
#[derive(Debug, thiserror::Error)]
pub enum JunctionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown store mode: {0}")]
    UnknownStoreMode(String),

    #[error("store mode '{0}' is not wired into this build")]
    StoreModeUnsupported(StoreMode),

    #[error("global session not found: {0}")]
    SessionNotFound(String),

    #[error("branch {branch_id} not found in global session {xid}")]
    BranchNotFound { xid: String, branch_id: u64 },

    #[error("branch {branch_id} already registered in global session {xid}")]
    BranchAlreadyExists { xid: String, branch_id: u64 },

    #[error("global session {xid} already reached terminal status {status:?}")]
    SessionTerminal {
        xid: String,
        status: session::GlobalStatus,
    },

    #[error("operation not allowed for global session {xid} in status {status:?}")]
    IllegalSessionStatus {
        xid: String,
        status: session::GlobalStatus,
    },

    #[error("lock on {key} is held by global transaction {owner}")]
    LockConflict { key: String, owner: String },

    #[error("malformed lock key: {0}")]
    LockKeyFormat(String),

    #[error("record payload of {size} bytes exceeds the write buffer cap of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid log record: {0}")]
    InvalidRecord(String),

    #[error("invalid status code: {0}")]
    InvalidStatusCode(u8),

    #[error("invalid branch type code: {0}")]
    InvalidBranchType(u8),

    #[error("invalid log operation code: {0}")]
    InvalidLogOperation(u8),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, JunctionError>;
