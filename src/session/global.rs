//! Global session: one distributed transaction spanning multiple branches.
//!
//! Binary record layout (big-endian, variable fields length-prefixed). The
//! branch-id slot is always zero in a global-only record; it keeps global
//! and branch records aligned on the same prefix:
//! ```text
//! [8 bytes transactionId]
//! [8 bytes branchId = 0]
//! [4 bytes timeout millis]
//! [2 bytes applicationId len][applicationId]
//! [2 bytes serviceGroup len][serviceGroup]
//! [2 bytes transactionName len][transactionName]
//! [4 bytes xid len][xid]
//! [8 bytes beginTime]
//! [1 byte status]
//! ```

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::session::branch::{
    read_string_u16, read_string_u32, read_u32, read_u64, read_u8, BranchSession,
};
use crate::session::next_session_id;
use crate::{JunctionError, Result};

// ============================================================================
// Global Status
// ============================================================================

/// Lifecycle status of a global transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GlobalStatus {
    /// Transaction open, branches may register
    Begin = 1,
    /// Phase-two commit in progress
    Committing = 2,
    /// Commit failed, retry scheduled
    CommitRetrying = 3,
    /// Phase-two rollback in progress
    Rollbacking = 4,
    /// Rollback failed, retry scheduled
    RollbackRetrying = 5,
    /// Timeout-triggered rollback in progress
    TimeoutRollbacking = 6,
    /// Timeout-triggered rollback failed, retry scheduled
    TimeoutRollbackRetrying = 7,
    /// Commit deferred to the async queue
    AsyncCommitting = 8,
    /// Terminal: committed
    Committed = 9,
    /// Terminal: commit gave up
    CommitFailed = 10,
    /// Terminal: rolled back
    Rolledback = 11,
    /// Terminal: rollback gave up
    RollbackFailed = 12,
    /// Terminal: fully finished and purged
    Finished = 15,
}

impl GlobalStatus {
    /// Whether this status ends the session; terminal sessions accept no
    /// further mutations.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Committed
                | GlobalStatus::CommitFailed
                | GlobalStatus::Rolledback
                | GlobalStatus::RollbackFailed
                | GlobalStatus::Finished
        )
    }

    /// Whether this status marks a scheduled phase-two retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GlobalStatus::CommitRetrying
                | GlobalStatus::RollbackRetrying
                | GlobalStatus::TimeoutRollbackRetrying
        )
    }
}

impl TryFrom<u8> for GlobalStatus {
    type Error = JunctionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(GlobalStatus::Begin),
            2 => Ok(GlobalStatus::Committing),
            3 => Ok(GlobalStatus::CommitRetrying),
            4 => Ok(GlobalStatus::Rollbacking),
            5 => Ok(GlobalStatus::RollbackRetrying),
            6 => Ok(GlobalStatus::TimeoutRollbacking),
            7 => Ok(GlobalStatus::TimeoutRollbackRetrying),
            8 => Ok(GlobalStatus::AsyncCommitting),
            9 => Ok(GlobalStatus::Committed),
            10 => Ok(GlobalStatus::CommitFailed),
            11 => Ok(GlobalStatus::Rolledback),
            12 => Ok(GlobalStatus::RollbackFailed),
            15 => Ok(GlobalStatus::Finished),
            other => Err(JunctionError::InvalidStatusCode(other)),
        }
    }
}

// ============================================================================
// Global Session
// ============================================================================

/// One distributed transaction and the branches registered against it.
///
/// Branch order is insertion order and must survive persistence: commit
/// walks branches forward, rollback walks them in reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSession {
    /// Globally unique transaction identifier, immutable
    pub xid: String,
    /// Numeric primary key in the log and the in-memory index, immutable
    pub transaction_id: u64,
    /// Application that opened the transaction
    pub application_id: String,
    /// Transaction service group of the opening application
    pub transaction_service_group: String,
    /// Human-readable transaction name
    pub transaction_name: String,
    /// Millis after which the transaction is eligible for forced rollback
    pub timeout_ms: u32,
    /// Creation timestamp, epoch millis
    pub begin_time: u64,
    /// Current status
    pub status: GlobalStatus,
    /// Registered branches, insertion order significant
    pub branch_sessions: Vec<BranchSession>,
}

impl GlobalSession {
    /// Open a new global transaction in `Begin` status.
    ///
    /// Assigns a fresh transaction id and derives the xid from it as
    /// `"{application_id}:{transaction_id}"`.
    pub fn begin(
        application_id: impl Into<String>,
        transaction_service_group: impl Into<String>,
        transaction_name: impl Into<String>,
        timeout_ms: u32,
    ) -> Self {
        let application_id = application_id.into();
        let transaction_id = next_session_id();
        Self {
            xid: format!("{application_id}:{transaction_id}"),
            transaction_id,
            application_id,
            transaction_service_group: transaction_service_group.into(),
            transaction_name: transaction_name.into(),
            timeout_ms,
            begin_time: now_millis(),
            status: GlobalStatus::Begin,
            branch_sessions: Vec::new(),
        }
    }

    /// Attach a registered branch; branch ids must be unique per session
    pub fn add_branch(&mut self, branch: BranchSession) -> Result<()> {
        if self.branch_sessions.iter().any(|b| b.branch_id == branch.branch_id) {
            return Err(JunctionError::BranchAlreadyExists {
                xid: self.xid.clone(),
                branch_id: branch.branch_id,
            });
        }
        self.branch_sessions.push(branch);
        Ok(())
    }

    /// Detach a branch; returns whether it was present
    pub fn remove_branch(&mut self, branch_id: u64) -> bool {
        let before = self.branch_sessions.len();
        self.branch_sessions.retain(|b| b.branch_id != branch_id);
        self.branch_sessions.len() != before
    }

    /// Look up a branch by id
    pub fn branch(&self, branch_id: u64) -> Option<&BranchSession> {
        self.branch_sessions.iter().find(|b| b.branch_id == branch_id)
    }

    /// Mutable branch lookup, used by the session manager's report path
    pub fn branch_mut(&mut self, branch_id: u64) -> Option<&mut BranchSession> {
        self.branch_sessions.iter_mut().find(|b| b.branch_id == branch_id)
    }

    /// Copy of the session without its branch list. Checkpointing writes
    /// branches as separate records, so the header copy avoids cloning
    /// potentially huge application-data blobs.
    pub fn clone_header(&self) -> Self {
        Self {
            xid: self.xid.clone(),
            transaction_id: self.transaction_id,
            application_id: self.application_id.clone(),
            transaction_service_group: self.transaction_service_group.clone(),
            transaction_name: self.transaction_name.clone(),
            timeout_ms: self.timeout_ms,
            begin_time: self.begin_time,
            status: self.status,
            branch_sessions: Vec::new(),
        }
    }

    /// Whether the session has outlived its timeout and is still live.
    /// Terminal sessions are never timed out; they are merely awaiting purge.
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        !self.status.is_terminal() && now_ms.saturating_sub(self.begin_time) > self.timeout_ms as u64
    }

    /// Serialize into the fixed binary layout (branch slot zeroed)
    pub fn encode(&self) -> Result<Vec<u8>> {
        for (name, value) in [
            ("applicationId", &self.application_id),
            ("serviceGroup", &self.transaction_service_group),
            ("transactionName", &self.transaction_name),
        ] {
            if value.len() > u16::MAX as usize {
                return Err(JunctionError::InvalidRecord(format!(
                    "{name} of {} bytes exceeds the 2-byte length prefix",
                    value.len()
                )));
            }
        }

        let mut buf = Vec::with_capacity(
            8 + 8 + 4
                + 2 + self.application_id.len()
                + 2 + self.transaction_service_group.len()
                + 2 + self.transaction_name.len()
                + 4 + self.xid.len()
                + 8 + 1,
        );
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&self.timeout_ms.to_be_bytes());
        buf.extend_from_slice(&(self.application_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.application_id.as_bytes());
        buf.extend_from_slice(&(self.transaction_service_group.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.transaction_service_group.as_bytes());
        buf.extend_from_slice(&(self.transaction_name.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.transaction_name.as_bytes());
        buf.extend_from_slice(&(self.xid.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.xid.as_bytes());
        buf.extend_from_slice(&self.begin_time.to_be_bytes());
        buf.push(self.status as u8);
        Ok(buf)
    }

    /// Parse a global session from its binary layout. Branch sessions are
    /// recorded separately and re-attached during replay.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);
        let transaction_id = read_u64(&mut rdr, "transactionId")?;
        let _branch_slot = read_u64(&mut rdr, "branchId")?;
        let timeout_ms = read_u32(&mut rdr, "timeout")?;
        let application_id = read_string_u16(&mut rdr, "applicationId")?;
        let transaction_service_group = read_string_u16(&mut rdr, "serviceGroup")?;
        let transaction_name = read_string_u16(&mut rdr, "transactionName")?;
        let xid = read_string_u32(&mut rdr, "xid")?;
        let begin_time = read_u64(&mut rdr, "beginTime")?;
        let status = GlobalStatus::try_from(read_u8(&mut rdr, "status")?)?;

        Ok(Self {
            xid,
            transaction_id,
            application_id,
            transaction_service_group,
            transaction_name,
            timeout_ms,
            begin_time,
            status,
            branch_sessions: Vec::new(),
        })
    }
}

/// Current wall-clock time in epoch millis
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
