//! Log record wrapper: one session mutation as stored on disk.
//!
//! Record payload:
//! ```text
//! [1 byte operation code][encoded session body]
//! ```
//! The body layout depends on whether the operation targets a global or a
//! branch session; both are fixed layouts with explicit length prefixes, so
//! a reader can always re-frame or reject a record without guessing.

use crate::session::{BranchSession, GlobalSession};
use crate::storage::LogOperation;
use crate::{JunctionError, Result};

/// Session body carried by a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPayload {
    Global(GlobalSession),
    Branch(BranchSession),
}

impl SessionPayload {
    /// Transaction id of the owning global transaction
    pub fn transaction_id(&self) -> u64 {
        match self {
            SessionPayload::Global(g) => g.transaction_id,
            SessionPayload::Branch(b) => b.transaction_id,
        }
    }

    /// XID of the owning global transaction
    pub fn xid(&self) -> &str {
        match self {
            SessionPayload::Global(g) => &g.xid,
            SessionPayload::Branch(b) => &b.xid,
        }
    }
}

/// One durable log record: an operation plus the session it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionWriteStore {
    pub operation: LogOperation,
    pub session: SessionPayload,
}

impl TransactionWriteStore {
    pub fn new(operation: LogOperation, session: SessionPayload) -> Self {
        Self { operation, session }
    }

    /// Serialize the record payload (operation byte + session body)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match &self.session {
            SessionPayload::Global(g) => {
                if !self.operation.is_global() {
                    return Err(JunctionError::InvalidRecord(format!(
                        "branch operation {:?} paired with a global session body",
                        self.operation
                    )));
                }
                g.encode()?
            }
            SessionPayload::Branch(b) => {
                if self.operation.is_global() {
                    return Err(JunctionError::InvalidRecord(format!(
                        "global operation {:?} paired with a branch session body",
                        self.operation
                    )));
                }
                b.encode()?
            }
        };
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(self.operation as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse a record payload
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&op_code, body) = bytes
            .split_first()
            .ok_or_else(|| JunctionError::InvalidRecord("empty record payload".to_string()))?;
        let operation = LogOperation::try_from(op_code)?;
        let session = if operation.is_global() {
            SessionPayload::Global(GlobalSession::decode(body)?)
        } else {
            SessionPayload::Branch(BranchSession::decode(body)?)
        };
        Ok(Self { operation, session })
    }
}
