//! Write operation types for modifying key-value state.

use serde::Deserialize;
use serde::Serialize;

use crate::LeaseId;
use crate::transaction::TxnCompare;
use crate::transaction::TxnOp;
use crate::transaction::TxnOpResult;

/// Commands for modifying key-value or lease state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a single key-value pair.
    Set { key: String, value: String },
    /// Set a key attached to a lease; the key is deleted when the lease ends.
    SetWithLease { key: String, value: String, lease_id: LeaseId },
    /// Delete a single key.
    Delete { key: String },
    /// Transaction: atomic If/Then/Else with rich comparisons.
    Transaction {
        compare: Vec<TxnCompare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    },
    /// Grant a new lease. `lease_id == 0` lets the store pick the identifier.
    LeaseGrant { lease_id: LeaseId, ttl_seconds: u32 },
    /// Revoke a lease and delete all attached keys.
    LeaseRevoke { lease_id: LeaseId },
    /// Refresh a lease's TTL.
    LeaseKeepalive { lease_id: LeaseId },
}

/// Request to perform a write operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    /// Create a Set command to store a key-value pair.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_command(WriteCommand::Set {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Create a Set command bound to a lease.
    pub fn set_with_lease(key: impl Into<String>, value: impl Into<String>, lease_id: LeaseId) -> Self {
        Self::from_command(WriteCommand::SetWithLease {
            key: key.into(),
            value: value.into(),
            lease_id,
        })
    }

    /// Create a Delete command.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::from_command(WriteCommand::Delete { key: key.into() })
    }

    /// Create a Transaction command.
    pub fn transaction(compare: Vec<TxnCompare>, success: Vec<TxnOp>, failure: Vec<TxnOp>) -> Self {
        Self::from_command(WriteCommand::Transaction {
            compare,
            success,
            failure,
        })
    }

    pub fn lease_grant(lease_id: LeaseId, ttl_seconds: u32) -> Self {
        Self::from_command(WriteCommand::LeaseGrant { lease_id, ttl_seconds })
    }

    pub fn lease_revoke(lease_id: LeaseId) -> Self {
        Self::from_command(WriteCommand::LeaseRevoke { lease_id })
    }

    pub fn lease_keepalive(lease_id: LeaseId) -> Self {
        Self::from_command(WriteCommand::LeaseKeepalive { lease_id })
    }

    /// Create from a raw WriteCommand.
    pub fn from_command(command: WriteCommand) -> Self {
        Self { command }
    }
}

/// Result of a write operation.
///
/// Only the fields relevant to the executed command are populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Whether a transaction took its success branch.
    pub succeeded: Option<bool>,
    /// Per-operation results of the executed transaction branch.
    pub txn_results: Option<Vec<TxnOpResult>>,
    /// Store revision after the write was applied.
    pub header_revision: Option<u64>,
    /// Lease granted or refreshed.
    pub lease_id: Option<LeaseId>,
    /// TTL of the granted or refreshed lease.
    pub ttl_seconds: Option<u32>,
    /// Number of keys removed by a delete or revoke.
    pub keys_deleted: Option<u32>,
}
