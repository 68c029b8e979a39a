//! Transaction types for atomic multi-key operations with conditions.

use serde::Deserialize;
use serde::Serialize;

use crate::KeyValueWithRevision;
use crate::LeaseId;
use crate::ScanOrder;

/// Comparison target for transaction conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareTarget {
    Value,
    Version,
    CreateRevision,
    ModRevision,
}

/// Comparison operator for transaction conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// A comparison condition for transactions.
///
/// Numeric targets carry their operand as a decimal string. A missing key
/// compares as version 0 and revision 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnCompare {
    pub key: String,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: String,
}

impl TxnCompare {
    /// Compare the create revision of `key`; revision 0 means "does not exist".
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: u64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision,
            op,
            value: revision.to_string(),
        }
    }

    /// Compare the stored value of `key`.
    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value,
            op,
            value: value.into(),
        }
    }

    /// Evaluate `actual` against this condition's operand.
    pub fn matches_u64(&self, actual: u64) -> bool {
        let expected: u64 = self.value.parse().unwrap_or(0);
        match self.op {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }

    /// Evaluate a string value against this condition's operand.
    pub fn matches_str(&self, actual: &str) -> bool {
        let expected = self.value.as_str();
        match self.op {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

/// Operations that can be performed in a transaction branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease_id: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    Get {
        key: String,
    },
    Range {
        prefix: String,
        limit: u32,
        order: ScanOrder,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease_id: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<String>, lease_id: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease_id: Some(lease_id),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    /// Range returning the oldest key under `prefix`.
    pub fn first_created(prefix: impl Into<String>) -> Self {
        TxnOp::Range {
            prefix: prefix.into(),
            limit: 1,
            order: ScanOrder::CreateRevisionAscending,
        }
    }
}

/// Result of a single transaction operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnOpResult {
    Put { revision: u64 },
    Delete { deleted: u32 },
    Get { kv: Option<KeyValueWithRevision> },
    Range { kvs: Vec<KeyValueWithRevision>, more: bool },
}
