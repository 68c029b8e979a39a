//! Queueing under a prefix and waiting for predecessors to leave.
//!
//! Mutexes and elections share one protocol: create a lease-bound key if it
//! does not exist yet, learn the oldest key under the prefix in the same
//! transaction, and if that is not us, wait for each older key to be deleted.

use futures::StreamExt;
use tether_core::KeyValueStore;
use tether_core::kv::CompareOp;
use tether_core::kv::KeyValueStoreError;
use tether_core::kv::KeyValueWithRevision;
use tether_core::kv::LeaseId;
use tether_core::kv::ReadRequest;
use tether_core::kv::ScanRequest;
use tether_core::kv::TxnCompare;
use tether_core::kv::TxnOp;
use tether_core::kv::TxnOpResult;
use tether_core::kv::WatchRequest;
use tether_core::kv::WriteRequest;
use tracing::debug;

use crate::error::CoordinationError;

/// Result of the create-if-absent transaction.
#[derive(Debug)]
pub(crate) struct Enqueued {
    /// Create revision of our key; the sequencer.
    pub create_revision: u64,
    /// Store revision the transaction was served at.
    pub header_revision: u64,
    /// Oldest key under the prefix, ourselves included.
    pub owner: Option<KeyValueWithRevision>,
    /// Our key as it was found when it already existed.
    pub existing: Option<KeyValueWithRevision>,
}

impl Enqueued {
    pub fn is_owner(&self, key: &str) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.key == key)
    }
}

fn malformed(reason: &str) -> CoordinationError {
    CoordinationError::Storage {
        source: KeyValueStoreError::Failed {
            reason: format!("malformed transaction response: {reason}"),
        },
    }
}

/// Create `key` under `prefix` bound to `lease_id` unless it already exists.
pub(crate) async fn enqueue<S: KeyValueStore + ?Sized>(
    store: &S,
    prefix: &str,
    key: &str,
    value: &str,
    lease_id: LeaseId,
) -> Result<Enqueued, CoordinationError> {
    let request = WriteRequest::transaction(
        vec![TxnCompare::create_revision(key, CompareOp::Equal, 0)],
        vec![TxnOp::put_with_lease(key, value, lease_id), TxnOp::first_created(prefix)],
        vec![TxnOp::get(key), TxnOp::first_created(prefix)],
    );
    let result = store.write(request).await?;

    let created = result.succeeded.ok_or_else(|| malformed("missing branch outcome"))?;
    let header_revision = result.header_revision.ok_or_else(|| malformed("missing header revision"))?;
    let mut ops = result.txn_results.unwrap_or_default().into_iter();

    let (create_revision, existing) = match (created, ops.next()) {
        (true, Some(TxnOpResult::Put { revision })) => (revision, None),
        (false, Some(TxnOpResult::Get { kv: Some(kv) })) => (kv.create_revision, Some(kv)),
        _ => return Err(malformed("unexpected first operation result")),
    };
    let owner = match ops.next() {
        Some(TxnOpResult::Range { kvs, .. }) => kvs.into_iter().next(),
        _ => return Err(malformed("missing owner range")),
    };

    Ok(Enqueued {
        create_revision,
        header_revision,
        owner,
        existing,
    })
}

/// Wait until `key` is deleted. Returns at once if it is already absent.
///
/// Subscribes before reading so a delete between the read and the
/// subscription cannot be missed.
pub(crate) async fn wait_delete<S: KeyValueStore + ?Sized>(store: &S, key: &str) -> Result<(), CoordinationError> {
    loop {
        let mut events = store.watch(WatchRequest::key(key)).await?;
        if store.read(ReadRequest::new(key)).await?.kv.is_none() {
            return Ok(());
        }

        loop {
            match events.next().await {
                Some(Ok(event)) if event.is_delete() => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(key, error = %err, "watch broken, resubscribing");
                    break;
                }
                None => {
                    debug!(key, "watch ended, resubscribing");
                    break;
                }
            }
        }
    }
}

/// Wait until no key under `prefix` has a create revision at or below `max_create_revision`.
///
/// Only the immediate predecessor is watched, so releasing a lock wakes one
/// waiter rather than the whole queue.
pub(crate) async fn wait_predecessors<S: KeyValueStore + ?Sized>(
    store: &S,
    prefix: &str,
    max_create_revision: u64,
) -> Result<(), CoordinationError> {
    loop {
        let scan = store.scan(ScanRequest::last_created_before(prefix, max_create_revision)).await?;
        let Some(predecessor) = scan.entries.into_iter().next() else {
            return Ok(());
        };
        debug!(
            prefix,
            predecessor = %predecessor.key,
            revision = predecessor.create_revision,
            "waiting for predecessor"
        );
        wait_delete(store, &predecessor.key).await?;
    }
}
