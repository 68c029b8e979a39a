//! Error types for sessions, mutexes and elections.

use snafu::Snafu;
use tether_core::kv::KeyValueStoreError;
use tether_core::kv::LeaseId;

/// Errors from coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The store could not be reached.
    #[snafu(display("store unreachable: {source}"))]
    Connection {
        /// The transport error.
        source: KeyValueStoreError,
    },

    /// The store refused to grant a lease.
    #[snafu(display("lease grant rejected: {source}"))]
    LeaseGrant {
        /// The store's error.
        source: KeyValueStoreError,
    },

    /// A single keepalive could not be delivered.
    #[snafu(display("lease {lease_id:x} refresh failed: {source}"))]
    LeaseRefresh {
        /// The lease being refreshed.
        lease_id: LeaseId,
        /// The store's error.
        source: KeyValueStoreError,
    },

    /// The session's lease is gone; keys it owned have been deleted.
    #[snafu(display("session expired: lease {lease_id:x} is no longer alive"))]
    SessionExpired {
        /// The lost lease.
        lease_id: LeaseId,
    },

    /// Lock acquisition did not finish before the deadline.
    #[snafu(display("timed out after {timeout_ms}ms waiting for lock '{prefix}'"))]
    LockTimeout {
        /// Lock prefix.
        prefix: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// Campaign did not win before the deadline.
    #[snafu(display("timed out after {timeout_ms}ms campaigning on '{prefix}'"))]
    CampaignTimeout {
        /// Election prefix.
        prefix: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// A non-blocking acquire found another holder.
    #[snafu(display("lock '{prefix}' is held by '{holder}'"))]
    Locked {
        /// Lock prefix.
        prefix: String,
        /// Key of the current holder.
        holder: String,
    },

    /// A resumed or held leadership no longer matches the store.
    #[snafu(display("leadership of '{prefix}' changed: '{key}' at revision {revision} is no longer the leader"))]
    LeaderChanged {
        /// Election prefix.
        prefix: String,
        /// The leader key this instance believed in.
        key: String,
        /// Its expected create revision.
        revision: u64,
    },

    /// No candidate holds the election.
    #[snafu(display("no leader under '{prefix}'"))]
    NoLeader {
        /// Election prefix.
        prefix: String,
    },

    /// The operation requires leadership this instance does not have.
    #[snafu(display("not the leader of '{prefix}'"))]
    NotLeader {
        /// Election prefix.
        prefix: String,
    },

    /// Underlying storage error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: KeyValueStoreError,
    },

    /// No store client is registered under the requested name.
    #[snafu(display("store client not found: {name}"))]
    UnknownClient {
        /// The requested client name.
        name: String,
    },
}

impl CoordinationError {
    /// Returns true if the same call may succeed when repeated.
    ///
    /// Session loss, leadership loss and configuration mistakes are final
    /// for the object that reported them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Connection { .. }
                | CoordinationError::LockTimeout { .. }
                | CoordinationError::CampaignTimeout { .. }
                | CoordinationError::Locked { .. }
        )
    }
}

impl From<KeyValueStoreError> for CoordinationError {
    fn from(source: KeyValueStoreError) -> Self {
        match source {
            KeyValueStoreError::Unavailable { .. } | KeyValueStoreError::Timeout { .. } => {
                CoordinationError::Connection { source }
            }
            KeyValueStoreError::LeaseNotFound { lease_id } => CoordinationError::SessionExpired { lease_id },
            source => CoordinationError::Storage { source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        let unavailable: CoordinationError = KeyValueStoreError::Unavailable {
            reason: "refused".to_string(),
        }
        .into();
        assert!(matches!(unavailable, CoordinationError::Connection { .. }));
        assert!(unavailable.is_retryable());

        let expired: CoordinationError = KeyValueStoreError::LeaseNotFound { lease_id: 0x2a }.into();
        assert!(matches!(expired, CoordinationError::SessionExpired { lease_id: 0x2a }));
        assert!(!expired.is_retryable());

        let storage: CoordinationError = KeyValueStoreError::EmptyKey.into();
        assert!(matches!(storage, CoordinationError::Storage { .. }));
    }

    #[test]
    fn display_uses_hex_lease_ids() {
        let err = CoordinationError::SessionExpired { lease_id: 255 };
        assert_eq!(err.to_string(), "session expired: lease ff is no longer alive");
    }
}
