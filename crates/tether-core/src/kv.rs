//! Key-value operation types.
//!
//! Re-exports `tether-kv-types` so consumers only need one import root.

pub use tether_kv_types::CompareOp;
pub use tether_kv_types::CompareTarget;
pub use tether_kv_types::DeleteRequest;
pub use tether_kv_types::KeyValueStoreError;
pub use tether_kv_types::KeyValueWithRevision;
pub use tether_kv_types::LeaseId;
pub use tether_kv_types::MAX_KEY_SIZE;
pub use tether_kv_types::MAX_TXN_OPS;
pub use tether_kv_types::MAX_VALUE_SIZE;
pub use tether_kv_types::ReadRequest;
pub use tether_kv_types::ReadResult;
pub use tether_kv_types::ScanOrder;
pub use tether_kv_types::ScanRequest;
pub use tether_kv_types::ScanResult;
pub use tether_kv_types::TxnCompare;
pub use tether_kv_types::TxnOp;
pub use tether_kv_types::TxnOpResult;
pub use tether_kv_types::WatchEvent;
pub use tether_kv_types::WatchEventKind;
pub use tether_kv_types::WatchRequest;
pub use tether_kv_types::WriteCommand;
pub use tether_kv_types::WriteRequest;
pub use tether_kv_types::WriteResult;
pub use tether_kv_types::validate_write_command;
