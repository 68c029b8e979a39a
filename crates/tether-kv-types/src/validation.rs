//! Fixed size limits for write commands.
//!
//! Limits are checked on the client before a command reaches the store so an
//! oversized request fails fast with a precise error.

use crate::KeyValueStoreError;
use crate::TxnOp;
use crate::WriteCommand;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum value size in bytes (1.5 MiB, the etcd request ceiling).
pub const MAX_VALUE_SIZE: u32 = 1536 * 1024;

/// Maximum number of compares plus operations in one transaction.
pub const MAX_TXN_OPS: u32 = 128;

fn check_key(key: &str) -> Result<(), KeyValueStoreError> {
    if key.is_empty() {
        return Err(KeyValueStoreError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE as usize {
        return Err(KeyValueStoreError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

fn check_value(value: &str) -> Result<(), KeyValueStoreError> {
    if value.len() > MAX_VALUE_SIZE as usize {
        return Err(KeyValueStoreError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

fn check_txn_op(op: &TxnOp) -> Result<(), KeyValueStoreError> {
    match op {
        TxnOp::Put { key, value, .. } => {
            check_key(key)?;
            check_value(value)
        }
        TxnOp::Delete { key } | TxnOp::Get { key } => check_key(key),
        // An empty prefix is a full-keyspace range, which is allowed.
        TxnOp::Range { .. } => Ok(()),
    }
}

/// Validate a write command against fixed size limits.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    match command {
        WriteCommand::Set { key, value } | WriteCommand::SetWithLease { key, value, .. } => {
            check_key(key)?;
            check_value(value)
        }
        WriteCommand::Delete { key } => check_key(key),
        WriteCommand::Transaction {
            compare,
            success,
            failure,
        } => {
            let size = compare.len() + success.len().max(failure.len());
            if size > MAX_TXN_OPS as usize {
                return Err(KeyValueStoreError::TooManyOperations {
                    size,
                    max: MAX_TXN_OPS,
                });
            }
            for cmp in compare {
                check_key(&cmp.key)?;
            }
            success.iter().chain(failure.iter()).try_for_each(check_txn_op)
        }
        WriteCommand::LeaseGrant { .. } | WriteCommand::LeaseRevoke { .. } | WriteCommand::LeaseKeepalive { .. } => {
            Ok(())
        }
    }
}
