//! Resource row-lock registry.
//!
//! Branch registration must hold every row its lock key names before the
//! branch may proceed, and two branches of different global transactions
//! must never hold overlapping rows. Acquisition is all-or-nothing inside a
//! single critical section, so no partial grant is ever observable.
//!
//! Lock key wire format, scoped to one resource id:
//! ```text
//! table1:pk1,pk2;table2:pk3
//! ```

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::{JunctionError, Result};

// ============================================================================
// Row Keys
// ============================================================================

/// One lockable row, scoped to a physical resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub resource_id: String,
    pub table: String,
    pub pk: String,
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.resource_id, self.table, self.pk)
    }
}

/// Parse a serialized lock key into row keys.
///
/// Blank input is legal (branches without row locks, e.g. TCC) and yields
/// no rows. Entries with a missing table or primary-key list are malformed.
pub fn parse_lock_key(resource_id: &str, lock_key: &str) -> Result<Vec<RowKey>> {
    let mut rows = Vec::new();
    for entry in lock_key.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((table, pks)) = entry.split_once(':') else {
            return Err(JunctionError::LockKeyFormat(entry.to_string()));
        };
        let table = table.trim();
        if table.is_empty() {
            return Err(JunctionError::LockKeyFormat(entry.to_string()));
        }
        let mut seen_pk = false;
        for pk in pks.split(',').map(str::trim) {
            if pk.is_empty() {
                return Err(JunctionError::LockKeyFormat(entry.to_string()));
            }
            seen_pk = true;
            rows.push(RowKey {
                resource_id: resource_id.to_string(),
                table: table.to_string(),
                pk: pk.to_string(),
            });
        }
        if !seen_pk {
            return Err(JunctionError::LockKeyFormat(entry.to_string()));
        }
    }
    Ok(rows)
}

// ============================================================================
// Lock Registry
// ============================================================================

/// Owner of a held row lock
#[derive(Debug, Clone)]
struct LockHolder {
    xid: String,
    branch_id: u64,
}

/// Row-lock table keyed by resource + table + primary key.
///
/// The table is guarded by a single mutex: an acquisition attempt is one
/// critical section over all of its keys, never a per-key interleaving.
pub struct LockRegistry {
    locks: Mutex<AHashMap<RowKey, LockHolder>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(AHashMap::new()),
        }
    }

    /// Acquire every row named by `lock_key` for the given branch, or
    /// acquire none. Re-acquisition by the same global transaction is
    /// allowed and keeps the original grant.
    ///
    /// Returns the rows newly granted by this call, so a caller whose
    /// follow-up durable write fails can hand back exactly those rows.
    pub fn acquire(
        &self,
        xid: &str,
        branch_id: u64,
        resource_id: &str,
        lock_key: &str,
    ) -> Result<Vec<RowKey>> {
        let rows = parse_lock_key(resource_id, lock_key)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut locks = self.locks.lock();
        for row in &rows {
            if let Some(holder) = locks.get(row) {
                if holder.xid != xid {
                    return Err(JunctionError::LockConflict {
                        key: row.to_string(),
                        owner: holder.xid.clone(),
                    });
                }
            }
        }
        let mut granted = Vec::new();
        for row in rows {
            if !locks.contains_key(&row) {
                locks.insert(
                    row.clone(),
                    LockHolder {
                        xid: xid.to_string(),
                        branch_id,
                    },
                );
                granted.push(row);
            }
        }
        Ok(granted)
    }

    /// Hand back specific rows, e.g. after a failed registration whose
    /// locks were already granted
    pub fn release_rows(&self, rows: &[RowKey]) -> usize {
        let mut locks = self.locks.lock();
        rows.iter().filter(|row| locks.remove(row).is_some()).count()
    }

    /// Pure read: true iff every row named by `lock_key` is either free or
    /// already owned by `xid`.
    pub fn is_lockable(&self, resource_id: &str, xid: &str, lock_key: &str) -> Result<bool> {
        let rows = parse_lock_key(resource_id, lock_key)?;
        let locks = self.locks.lock();
        Ok(rows
            .iter()
            .all(|row| locks.get(row).map_or(true, |holder| holder.xid == xid)))
    }

    /// Release every row held by the global transaction; returns how many
    /// rows were freed
    pub fn release_xid(&self, xid: &str) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, holder| holder.xid != xid);
        before - locks.len()
    }

    /// Number of rows currently held (for monitoring)
    pub fn held_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Branch that holds a given row, if any (for diagnostics)
    pub fn holder_of(&self, row: &RowKey) -> Option<(String, u64)> {
        self.locks
            .lock()
            .get(row)
            .map(|holder| (holder.xid.clone(), holder.branch_id))
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
