//! Session model and in-memory session management.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  SessionHolder                                   │
//! │  - Wires the configured store backend            │
//! │  - Replays the log before anything is served     │
//! ├──────────────────────────────────────────────────┤
//! │  SessionManager                                  │
//! │  - transactionId / xid / status indices          │
//! │  - Write-log-then-mutate-memory on every change  │
//! ├──────────────────────────────────────────────────┤
//! │  GlobalSession ── owns ──▶ BranchSession*        │
//! │  - Pure data + status predicates + record codec  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod branch;
pub mod global;
pub mod holder;
pub mod manager;

pub use branch::{BranchSession, BranchStatus, BranchType, LockStatus};
pub use global::{GlobalSession, GlobalStatus};
pub use holder::SessionHolder;
pub use manager::SessionManager;

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Session id generator, seeded from the epoch so ids stay unique across
/// restarts without a coordination round.
static NEXT_SESSION_ID: Lazy<AtomicU64> =
    Lazy::new(|| AtomicU64::new(global::now_millis() << 16));

/// Next transaction/branch identifier
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }
}
