//! Key-value types shared by the store boundary and the coordination primitives.
//!
//! Everything in this crate is a plain value type: requests the coordination
//! layer sends to the store, the results it gets back, and the errors a store
//! implementation may report. No I/O happens here.
//!
//! ## Module Organization
//!
//! - [`read`]: Single-key reads, prefix scans and deletes
//! - [`transaction`]: Compare/then/else transactions
//! - [`mod@write`]: Write commands, including lease grant/keepalive/revoke
//! - [`watch`]: Change-notification subscriptions
//! - [`validation`]: Fixed size limits enforced before a command is sent

pub mod read;
pub mod transaction;
pub mod validation;
pub mod watch;
pub mod write;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

pub use read::DeleteRequest;
pub use read::ReadRequest;
pub use read::ReadResult;
pub use read::ScanOrder;
pub use read::ScanRequest;
pub use read::ScanResult;
pub use transaction::CompareOp;
pub use transaction::CompareTarget;
pub use transaction::TxnCompare;
pub use transaction::TxnOp;
pub use transaction::TxnOpResult;
pub use validation::MAX_KEY_SIZE;
pub use validation::MAX_TXN_OPS;
pub use validation::MAX_VALUE_SIZE;
pub use validation::validate_write_command;
pub use watch::WatchEvent;
pub use watch::WatchEventKind;
pub use watch::WatchRequest;
pub use write::WriteCommand;
pub use write::WriteRequest;
pub use write::WriteResult;

/// Identifier of a server-issued lease.
pub type LeaseId = u64;

/// A stored entry together with its revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Key-specific version number, 1 on creation and incremented on each put.
    pub version: u64,
    /// Store revision at which the key was created.
    ///
    /// Never changes while the key exists. Coordination primitives use it as
    /// the sequencer that orders candidates under a prefix.
    pub create_revision: u64,
    /// Store revision of the last modification.
    pub mod_revision: u64,
    /// Lease the key is attached to, if any.
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
}

/// Errors reported by a key-value store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// The requested key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The store rejected or failed the operation.
    #[snafu(display("operation failed: {reason}"))]
    Failed {
        /// Why the operation failed.
        reason: String,
    },

    /// The store could not be reached.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Transport-level description.
        reason: String,
    },

    /// The operation did not complete in time.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout {
        /// How long the caller waited.
        duration_ms: u64,
    },

    /// Keys must be non-empty.
    #[snafu(display("key cannot be empty"))]
    EmptyKey,

    /// Key exceeds [`MAX_KEY_SIZE`].
    #[snafu(display("key size {size} exceeds maximum of {max} bytes"))]
    KeyTooLarge {
        /// Actual key size in bytes.
        size: usize,
        /// Allowed maximum.
        max: u32,
    },

    /// Value exceeds [`MAX_VALUE_SIZE`].
    #[snafu(display("value size {size} exceeds maximum of {max} bytes"))]
    ValueTooLarge {
        /// Actual value size in bytes.
        size: usize,
        /// Allowed maximum.
        max: u32,
    },

    /// A transaction carries more operations than [`MAX_TXN_OPS`].
    #[snafu(display("transaction has {size} operations, maximum is {max}"))]
    TooManyOperations {
        /// Number of compares plus operations.
        size: usize,
        /// Allowed maximum.
        max: u32,
    },

    /// The lease is unknown to the store: never granted, revoked, or expired.
    #[snafu(display("lease {lease_id:x} not found"))]
    LeaseNotFound {
        /// The lease the request referenced.
        lease_id: LeaseId,
    },
}

impl KeyValueStoreError {
    /// Returns true if the error means the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KeyValueStoreError::Unavailable { .. } | KeyValueStoreError::Timeout { .. })
    }
}
