//! FIFO mutual exclusion over a key prefix.
//!
//! Each contender writes one key under the prefix, attached to its session's
//! lease. The store's create revision orders the keys; the oldest key holds
//! the lock and everyone else waits for the key directly ahead of theirs to
//! be deleted. A holder that dies releases the lock when its lease expires.

use std::sync::Arc;
use std::time::Duration;

use tether_core::KeyValueStore;
use tether_core::kv::CompareOp;
use tether_core::kv::ReadRequest;
use tether_core::kv::TxnCompare;
use tether_core::kv::WriteRequest;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CoordinationError;
use crate::keys::candidate_key;
use crate::keys::normalize_prefix;
use crate::session::Session;
use crate::wait::enqueue;
use crate::wait::wait_predecessors;

/// A distributed mutex bound to a [`Session`].
///
/// Not reentrant across instances: two `Mutex` values on the same prefix,
/// even from one session, queue behind each other.
pub struct Mutex<S: KeyValueStore + ?Sized + 'static> {
    session: Session<S>,
    prefix: String,
    key: Option<String>,
    is_held: bool,
    create_revision: u64,
    header_revision: u64,
}

impl<S: KeyValueStore + ?Sized + 'static> std::fmt::Debug for Mutex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("prefix", &self.prefix)
            .field("key", &self.key)
            .field("is_held", &self.is_held)
            .field("create_revision", &self.create_revision)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Mutex<S> {
    pub(crate) fn new(session: Session<S>, prefix: &str) -> Self {
        Self {
            session,
            prefix: normalize_prefix(prefix),
            key: None,
            is_held: false,
            create_revision: 0,
            header_revision: 0,
        }
    }

    /// Acquire the lock, waiting up to `timeout` (forever if `None`).
    ///
    /// On timeout the caller's key is deleted and other waiters are left
    /// untouched. If the session ends while waiting this returns
    /// [`CoordinationError::SessionExpired`]. A failed call on a mutex that
    /// is already held leaves it held.
    pub async fn lock(&mut self, timeout: Option<Duration>) -> Result<(), CoordinationError> {
        self.session.ensure_active()?;
        let was_held = self.is_held;
        let key = self.candidate();

        let outcome = match timeout {
            None => self.acquire(&key).await,
            Some(limit) => match tokio::time::timeout(limit, self.acquire(&key)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoordinationError::LockTimeout {
                    prefix: self.prefix.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        };

        match outcome {
            Ok((create_revision, header_revision)) => {
                self.is_held = true;
                self.create_revision = create_revision;
                self.header_revision = header_revision;
                info!(prefix = %self.prefix, key = %key, revision = create_revision, "lock acquired");
                Ok(())
            }
            Err(err) => Err(self.fail(&key, was_held, err).await),
        }
    }

    /// Acquire the lock only if nobody else holds it.
    ///
    /// Returns [`CoordinationError::Locked`] naming the holder's key otherwise.
    pub async fn try_lock(&mut self) -> Result<(), CoordinationError> {
        self.session.ensure_active()?;
        let was_held = self.is_held;
        let key = self.candidate();
        let store = Arc::clone(self.session.store());

        let enqueued = match enqueue(&*store, &self.prefix, &key, "", self.session.lease_id()).await {
            Ok(enqueued) => enqueued,
            Err(err) => return Err(self.fail(&key, was_held, err).await),
        };

        if enqueued.is_owner(&key) {
            self.is_held = true;
            self.create_revision = enqueued.create_revision;
            self.header_revision = enqueued.header_revision;
            info!(prefix = %self.prefix, key = %key, revision = enqueued.create_revision, "lock acquired");
            return Ok(());
        }

        let holder = enqueued.owner.map(|owner| owner.key).unwrap_or_default();
        self.abandon(&key).await;
        Err(CoordinationError::Locked {
            prefix: self.prefix.clone(),
            holder,
        })
    }

    /// Release the lock.
    ///
    /// Unlocking a mutex that is not held does nothing and returns `Ok`,
    /// apart from removing a queue key a failed acquire could not delete.
    pub async fn unlock(&mut self) -> Result<(), CoordinationError> {
        let Some(key) = self.key.as_deref() else {
            debug!(prefix = %self.prefix, "unlock on a mutex that is not held");
            return Ok(());
        };

        self.session.store().write(WriteRequest::delete(key)).await?;
        if self.is_held {
            info!(prefix = %self.prefix, key = %key, "lock released");
        } else {
            debug!(prefix = %self.prefix, key = %key, "leftover lock key removed");
        }

        self.key = None;
        self.is_held = false;
        self.create_revision = 0;
        Ok(())
    }

    /// Key of the held lock, or an empty string when not held.
    pub fn key(&self) -> &str {
        match &self.key {
            Some(key) if self.is_held => key.as_str(),
            _ => "",
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_held(&self) -> bool {
        self.is_held
    }

    /// Create revision of the held key; usable as a fencing token.
    pub fn create_revision(&self) -> u64 {
        self.create_revision
    }

    /// Store revision observed when the lock was acquired.
    pub fn header_revision(&self) -> u64 {
        self.header_revision
    }

    /// Comparison that holds only while this mutex owns the lock.
    ///
    /// Add it to a transaction to make writes conditional on ownership.
    /// `None` when the lock is not held.
    pub fn is_owner_cmp(&self) -> Option<TxnCompare> {
        self.is_held.then(|| TxnCompare::create_revision(self.key(), CompareOp::Equal, self.create_revision))
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    /// Our key, created on first use. Recorded before any request so a
    /// timeout can clean it up.
    fn candidate(&mut self) -> String {
        let session = &self.session;
        let prefix = &self.prefix;
        self.key
            .get_or_insert_with(|| candidate_key(prefix, session.lease_id(), session.next_sequence()))
            .clone()
    }

    async fn acquire(&self, key: &str) -> Result<(u64, u64), CoordinationError> {
        let store = self.session.store();
        let lease_id = self.session.lease_id();

        let enqueued = enqueue(&**store, &self.prefix, key, "", lease_id).await?;
        if enqueued.is_owner(key) {
            return Ok((enqueued.create_revision, enqueued.header_revision));
        }

        debug!(prefix = %self.prefix, key, revision = enqueued.create_revision, "lock contended, waiting");
        tokio::select! {
            waited = wait_predecessors(&**store, &self.prefix, enqueued.create_revision - 1) => waited?,
            _ = self.session.done() => return Err(CoordinationError::SessionExpired { lease_id }),
        }

        // The key vanishes if the lease expired while we waited.
        let current = store.read(ReadRequest::new(key)).await?;
        if current.kv.is_none() {
            return Err(CoordinationError::SessionExpired { lease_id });
        }
        Ok((enqueued.create_revision, current.header_revision))
    }

    /// Settle local state after a failed acquire.
    ///
    /// A lock held before the call stays held unless the session is gone;
    /// otherwise the key this call queued is withdrawn.
    async fn fail(&mut self, key: &str, was_held: bool, err: CoordinationError) -> CoordinationError {
        match (&err, was_held) {
            (CoordinationError::SessionExpired { .. }, true) => {
                self.is_held = false;
                self.key = None;
                self.create_revision = 0;
            }
            (_, true) => warn!(prefix = %self.prefix, key, error = %err, "re-lock failed, lock still held"),
            (_, false) => self.abandon(key).await,
        }
        err
    }

    /// Best-effort removal of our key after a failed acquire. The key is
    /// kept when the delete fails so [`unlock`](Self::unlock) can retry.
    async fn abandon(&mut self, key: &str) {
        self.is_held = false;
        self.create_revision = 0;

        let timeout = self.session.config().request_timeout;
        match tokio::time::timeout(timeout, self.session.store().write(WriteRequest::delete(key))).await {
            Ok(Ok(_)) => {
                self.key = None;
                debug!(prefix = %self.prefix, key, "abandoned lock key removed");
            }
            Ok(Err(err)) => warn!(prefix = %self.prefix, key, error = %err, "failed to remove abandoned lock key"),
            Err(_) => warn!(prefix = %self.prefix, key, "timed out removing abandoned lock key"),
        }
    }
}

