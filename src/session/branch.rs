//! Branch session: one resource-local operation inside a global transaction.
//!
//! Binary record layout (big-endian, every variable field length-prefixed):
//! ```text
//! [8 bytes transactionId]
//! [8 bytes branchId]
//! [4 bytes resourceId len][resourceId]
//! [4 bytes lockKey len][lockKey]
//! [2 bytes clientId len][clientId]
//! [4 bytes applicationData len][applicationData]
//! [4 bytes xid len][xid]
//! [1 byte status]
//! [1 byte lock status]
//! [1 byte branch type]
//! ```

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::{JunctionError, Result};

// ============================================================================
// Branch Status
// ============================================================================

/// Lifecycle status of a branch transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BranchStatus {
    /// Branch registered with the coordinator
    Registered = 1,
    /// Phase one (local prepare) finished successfully
    PhaseOneDone = 2,
    /// Phase one failed; the branch can be discarded
    PhaseOneFailed = 3,
    /// Phase one timed out on the resource side
    PhaseOneTimeout = 4,
    /// Phase two commit finished
    PhaseTwoCommitted = 5,
    /// Phase two commit failed but may be retried
    PhaseTwoCommitFailedRetryable = 6,
    /// Phase two commit failed permanently
    PhaseTwoCommitFailedUnretryable = 7,
    /// Phase two rollback finished
    PhaseTwoRollbacked = 8,
    /// Phase two rollback failed but may be retried
    PhaseTwoRollbackFailedRetryable = 9,
    /// Phase two rollback failed permanently
    PhaseTwoRollbackFailedUnretryable = 10,
}

impl BranchStatus {
    /// Whether phase two may be attempted again for this status
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseTwoCommitFailedRetryable
                | BranchStatus::PhaseTwoRollbackFailedRetryable
        )
    }

    /// Whether phase two already completed for this branch
    pub fn is_phase_two_done(&self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseTwoCommitted | BranchStatus::PhaseTwoRollbacked
        )
    }
}

impl TryFrom<u8> for BranchStatus {
    type Error = JunctionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BranchStatus::Registered),
            2 => Ok(BranchStatus::PhaseOneDone),
            3 => Ok(BranchStatus::PhaseOneFailed),
            4 => Ok(BranchStatus::PhaseOneTimeout),
            5 => Ok(BranchStatus::PhaseTwoCommitted),
            6 => Ok(BranchStatus::PhaseTwoCommitFailedRetryable),
            7 => Ok(BranchStatus::PhaseTwoCommitFailedUnretryable),
            8 => Ok(BranchStatus::PhaseTwoRollbacked),
            9 => Ok(BranchStatus::PhaseTwoRollbackFailedRetryable),
            10 => Ok(BranchStatus::PhaseTwoRollbackFailedUnretryable),
            other => Err(JunctionError::InvalidStatusCode(other)),
        }
    }
}

// ============================================================================
// Branch Type
// ============================================================================

/// Commit/rollback protocol the registering resource manager speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BranchType {
    /// Automatic (undo-log based) two-phase branch
    At = 0,
    /// Try/Confirm/Cancel branch
    Tcc = 1,
    /// Saga compensation branch
    Saga = 2,
    /// XA protocol branch
    Xa = 3,
}

impl TryFrom<u8> for BranchType {
    type Error = JunctionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BranchType::At),
            1 => Ok(BranchType::Tcc),
            2 => Ok(BranchType::Saga),
            3 => Ok(BranchType::Xa),
            other => Err(JunctionError::InvalidBranchType(other)),
        }
    }
}

// ============================================================================
// Lock Status
// ============================================================================

/// Whether the branch currently holds its row locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockStatus {
    /// Row locks are held
    Locked = 0,
    /// Row locks have been released
    Unlocked = 1,
}

impl TryFrom<u8> for LockStatus {
    type Error = JunctionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LockStatus::Locked),
            1 => Ok(LockStatus::Unlocked),
            other => Err(JunctionError::InvalidStatusCode(other)),
        }
    }
}

// ============================================================================
// Branch Session
// ============================================================================

/// One resource branch participating in a global transaction.
///
/// Owned exclusively by its parent global session: a branch record in the
/// log never outlives the parent's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSession {
    /// XID of the owning global session
    pub xid: String,
    /// Transaction id of the owning global session
    pub transaction_id: u64,
    /// Branch identifier, assigned at registration, immutable
    pub branch_id: u64,
    /// Physical resource this branch touches
    pub resource_id: String,
    /// Protocol the resource manager expects
    pub branch_type: BranchType,
    /// Current branch status
    pub status: BranchStatus,
    /// Serialized row/key descriptors this branch holds locked
    pub lock_key: String,
    /// Registering resource-manager instance
    pub client_id: String,
    /// Opaque context blob supplied by the resource manager
    pub application_data: Vec<u8>,
    /// Row-lock state of the branch
    pub lock_status: LockStatus,
}

impl BranchSession {
    /// Create a freshly registered branch
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        xid: impl Into<String>,
        transaction_id: u64,
        branch_id: u64,
        resource_id: impl Into<String>,
        branch_type: BranchType,
        lock_key: impl Into<String>,
        client_id: impl Into<String>,
        application_data: Vec<u8>,
    ) -> Self {
        Self {
            xid: xid.into(),
            transaction_id,
            branch_id,
            resource_id: resource_id.into(),
            branch_type,
            status: BranchStatus::Registered,
            lock_key: lock_key.into(),
            client_id: client_id.into(),
            application_data,
            lock_status: LockStatus::Locked,
        }
    }

    /// Serialize into the fixed binary layout
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.client_id.len() > u16::MAX as usize {
            return Err(JunctionError::InvalidRecord(format!(
                "client id of {} bytes exceeds the 2-byte length prefix",
                self.client_id.len()
            )));
        }
        if self.application_data.len() > u32::MAX as usize {
            return Err(JunctionError::InvalidRecord(format!(
                "application data of {} bytes exceeds the 4-byte length prefix",
                self.application_data.len()
            )));
        }

        let mut buf = Vec::with_capacity(
            8 + 8
                + 4 + self.resource_id.len()
                + 4 + self.lock_key.len()
                + 2 + self.client_id.len()
                + 4 + self.application_data.len()
                + 4 + self.xid.len()
                + 3,
        );
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.branch_id.to_be_bytes());
        buf.extend_from_slice(&(self.resource_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.resource_id.as_bytes());
        buf.extend_from_slice(&(self.lock_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.lock_key.as_bytes());
        buf.extend_from_slice(&(self.client_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.client_id.as_bytes());
        buf.extend_from_slice(&(self.application_data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.application_data);
        buf.extend_from_slice(&(self.xid.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.xid.as_bytes());
        buf.push(self.status as u8);
        buf.push(self.lock_status as u8);
        buf.push(self.branch_type as u8);
        Ok(buf)
    }

    /// Parse a branch session from its binary layout
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);
        let transaction_id = read_u64(&mut rdr, "transactionId")?;
        let branch_id = read_u64(&mut rdr, "branchId")?;
        let resource_id = read_string_u32(&mut rdr, "resourceId")?;
        let lock_key = read_string_u32(&mut rdr, "lockKey")?;
        let client_id = read_string_u16(&mut rdr, "clientId")?;
        let application_data = read_bytes_u32(&mut rdr, "applicationData")?;
        let xid = read_string_u32(&mut rdr, "xid")?;
        let status = BranchStatus::try_from(read_u8(&mut rdr, "status")?)?;
        let lock_status = LockStatus::try_from(read_u8(&mut rdr, "lockStatus")?)?;
        let branch_type = BranchType::try_from(read_u8(&mut rdr, "branchType")?)?;

        Ok(Self {
            xid,
            transaction_id,
            branch_id,
            resource_id,
            branch_type,
            status,
            lock_key,
            client_id,
            application_data,
            lock_status,
        })
    }
}

// ============================================================================
// Layout helpers (shared with the global-session codec)
// ============================================================================

pub(crate) fn read_u8(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<u8> {
    rdr.read_u8()
        .map_err(|_| truncated(field))
}

pub(crate) fn read_u16(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<u16> {
    rdr.read_u16::<BigEndian>().map_err(|_| truncated(field))
}

pub(crate) fn read_u32(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<u32> {
    rdr.read_u32::<BigEndian>().map_err(|_| truncated(field))
}

pub(crate) fn read_u64(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<u64> {
    rdr.read_u64::<BigEndian>().map_err(|_| truncated(field))
}

pub(crate) fn read_bytes_u32(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<Vec<u8>> {
    let len = read_u32(rdr, field)? as usize;
    read_exact(rdr, len, field)
}

pub(crate) fn read_string_u32(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<String> {
    let len = read_u32(rdr, field)? as usize;
    into_string(read_exact(rdr, len, field)?, field)
}

pub(crate) fn read_string_u16(rdr: &mut Cursor<&[u8]>, field: &str) -> Result<String> {
    let len = read_u16(rdr, field)? as usize;
    into_string(read_exact(rdr, len, field)?, field)
}

fn read_exact(rdr: &mut Cursor<&[u8]>, len: usize, field: &str) -> Result<Vec<u8>> {
    let remaining = rdr.get_ref().len() as u64 - rdr.position();
    if (len as u64) > remaining {
        return Err(truncated(field));
    }
    let mut buf = vec![0u8; len];
    rdr.read_exact(&mut buf).map_err(|_| truncated(field))?;
    Ok(buf)
}

fn into_string(bytes: Vec<u8>, field: &str) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| JunctionError::InvalidRecord(format!("{field} is not valid UTF-8")))
}

fn truncated(field: &str) -> JunctionError {
    JunctionError::InvalidRecord(format!("record truncated while reading {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_branch(application_data: Vec<u8>) -> BranchSession {
        BranchSession::new(
            "order-svc:1001",
            1001,
            2001,
            "jdbc:mysql://db1/orders",
            BranchType::At,
            "orders:1,2,3",
            "order-svc-rm-1",
            application_data,
        )
    }

    #[test]
    fn test_branch_round_trip() {
        let mut branch = sample_branch(b"undo-log-context".to_vec());
        branch.status = BranchStatus::PhaseOneDone;
        branch.lock_status = LockStatus::Unlocked;

        let bytes = branch.encode().unwrap();
        let decoded = BranchSession::decode(&bytes).unwrap();
        assert_eq!(decoded, branch);
    }

    #[test]
    fn test_branch_round_trip_empty_fields() {
        let branch = BranchSession::new("", 7, 8, "", BranchType::Saga, "", "", Vec::new());
        let bytes = branch.encode().unwrap();
        let decoded = BranchSession::decode(&bytes).unwrap();
        assert_eq!(decoded, branch);
    }

    #[test]
    fn test_branch_round_trip_large_payload() {
        let branch = sample_branch(vec![b'A'; 1024 * 1024]);
        let bytes = branch.encode().unwrap();
        let decoded = BranchSession::decode(&bytes).unwrap();
        assert_eq!(decoded.application_data, branch.application_data);
    }

    #[test]
    fn test_branch_decode_truncated() {
        let branch = sample_branch(b"ctx".to_vec());
        let bytes = branch.encode().unwrap();
        // Cut the record in the middle of the xid field
        let cut = bytes.len() - 6;
        let err = BranchSession::decode(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, JunctionError::InvalidRecord(_)));
    }

    #[test]
    fn test_branch_decode_bad_status() {
        let branch = sample_branch(Vec::new());
        let mut bytes = branch.encode().unwrap();
        let status_at = bytes.len() - 3;
        bytes[status_at] = 200;
        let err = BranchSession::decode(&bytes).unwrap_err();
        assert!(matches!(err, JunctionError::InvalidStatusCode(200)));
    }

    #[test]
    fn test_branch_status_predicates() {
        assert!(BranchStatus::PhaseTwoCommitFailedRetryable.is_retryable());
        assert!(BranchStatus::PhaseTwoRollbackFailedRetryable.is_retryable());
        assert!(!BranchStatus::Registered.is_retryable());
        assert!(BranchStatus::PhaseTwoCommitted.is_phase_two_done());
        assert!(!BranchStatus::PhaseOneDone.is_phase_two_done());
    }
}
