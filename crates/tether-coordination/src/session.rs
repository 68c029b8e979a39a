//! Lease-backed liveness shared by mutexes and elections.
//!
//! A [`Session`] owns one store lease and one background task that keeps it
//! alive. Every key a mutex or election writes is attached to that lease, so
//! when the session dies (closed, or keepalives lost for a full TTL) the store
//! deletes those keys and waiters further down the queue move up.
//!
//! # State machine
//!
//! ```text
//! Active ──close()/orphan()──▶ Closed
//!    └────keepalive lost─────▶ Expired
//! ```
//!
//! Transitions only leave `Active`; the first one wins.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tether_core::KeyValueStore;
use tether_core::SessionSettings;
use tether_core::constants::DEFAULT_KEEPALIVE_RETRY_MS;
use tether_core::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use tether_core::constants::DEFAULT_SESSION_TTL_SECS;
use tether_core::constants::KEEPALIVE_INTERVAL_DIVISOR;
use tether_core::constants::MIN_KEEPALIVE_INTERVAL_MS;
use tether_core::constants::MIN_SESSION_TTL_SECS;
use tether_core::kv::KeyValueStoreError;
use tether_core::kv::LeaseId;
use tether_core::kv::WriteRequest;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::election::Election;
use crate::error::CoordinationError;
use crate::locker::Locker;
use crate::mutex::Mutex;

/// Observable lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Lease granted and being kept alive.
    Active,
    /// Keepalives failed for a full TTL, or the store reported the lease gone.
    Expired,
    /// Closed or orphaned by the owner.
    Closed,
}

/// Options for [`Session::open_with_config`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lease TTL requested from the store, in seconds.
    pub ttl_seconds: u32,
    /// Time between keepalives. Defaults to a third of the TTL.
    pub keepalive_interval: Option<Duration>,
    /// Delay before retrying a failed keepalive.
    pub retry_interval: Duration,
    /// Upper bound on each lease request.
    pub request_timeout: Duration,
    /// Attach to this existing lease instead of granting a new one.
    pub lease_id: Option<LeaseId>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_SESSION_TTL_SECS,
            keepalive_interval: None,
            retry_interval: Duration::from_millis(DEFAULT_KEEPALIVE_RETRY_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            lease_id: None,
        }
    }
}

impl SessionConfig {
    /// Session options from loaded configuration.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            ttl_seconds: settings.ttl_secs,
            retry_interval: settings.keepalive_retry(),
            request_timeout: settings.request_timeout(),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_lease(mut self, lease_id: LeaseId) -> Self {
        self.lease_id = Some(lease_id);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    fn requested_ttl(&self) -> u32 {
        self.ttl_seconds.max(MIN_SESSION_TTL_SECS)
    }

    /// Never more than half the TTL and never below the floor.
    fn keepalive_interval_for(&self, ttl: Duration) -> Duration {
        self.keepalive_interval
            .unwrap_or(ttl / KEEPALIVE_INTERVAL_DIVISOR)
            .min(ttl / 2)
            .max(Duration::from_millis(MIN_KEEPALIVE_INTERVAL_MS))
    }
}

/// A lease plus the task that keeps it alive.
///
/// Cheap to clone; all clones share one lease. The lease is revoked by
/// [`close`](Self::close). Dropping the last clone stops the keepalive task
/// and leaves the lease to expire on its TTL.
pub struct Session<S: KeyValueStore + ?Sized + 'static> {
    inner: Arc<SessionInner<S>>,
}

impl<S: KeyValueStore + ?Sized + 'static> Clone for Session<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease_id", &format_args!("{:x}", self.inner.lease_id))
            .field("ttl", &self.inner.ttl)
            .field("state", &self.state())
            .finish()
    }
}

struct SessionInner<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    lease_id: LeaseId,
    ttl: Duration,
    config: SessionConfig,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
    is_closed: AtomicBool,
    sequence: AtomicU64,
    keepalive: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for SessionInner<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Move out of `Active`. Returns false if another transition already happened.
fn leave_active(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if *current == SessionState::Active {
            *current = next;
            true
        } else {
            false
        }
    })
}

async fn send_keepalive<S: KeyValueStore + ?Sized>(
    store: &S,
    lease_id: LeaseId,
    request_timeout: Duration,
) -> Result<(), CoordinationError> {
    match tokio::time::timeout(request_timeout, store.write(WriteRequest::lease_keepalive(lease_id))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(KeyValueStoreError::LeaseNotFound { .. })) => Err(CoordinationError::SessionExpired { lease_id }),
        Ok(Err(source)) => Err(CoordinationError::LeaseRefresh { lease_id, source }),
        Err(_) => Err(CoordinationError::LeaseRefresh {
            lease_id,
            source: KeyValueStoreError::Timeout {
                duration_ms: request_timeout.as_millis() as u64,
            },
        }),
    }
}

struct Keepalive<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    lease_id: LeaseId,
    ttl: Duration,
    interval: Duration,
    retry_interval: Duration,
    request_timeout: Duration,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
}

impl<S: KeyValueStore + ?Sized + 'static> Keepalive<S> {
    async fn run(self) {
        let mut last_refresh = Instant::now();
        let mut delay = self.interval;

        debug!(
            lease_id = format_args!("{:x}", self.lease_id),
            interval_ms = self.interval.as_millis() as u64,
            "keepalive loop started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(lease_id = format_args!("{:x}", self.lease_id), "keepalive loop stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = send_keepalive(&*self.store, self.lease_id, self.request_timeout) => result,
            };

            match result {
                Ok(()) => {
                    last_refresh = Instant::now();
                    delay = self.interval;
                }
                Err(CoordinationError::SessionExpired { .. }) => {
                    if leave_active(&self.state, SessionState::Expired) {
                        warn!(lease_id = format_args!("{:x}", self.lease_id), "lease no longer exists, session expired");
                    }
                    return;
                }
                Err(err) => {
                    let elapsed = last_refresh.elapsed();
                    if elapsed >= self.ttl {
                        if leave_active(&self.state, SessionState::Expired) {
                            warn!(
                                lease_id = format_args!("{:x}", self.lease_id),
                                error = %err,
                                "keepalives failed for a full TTL, session expired"
                            );
                        }
                        return;
                    }
                    let remaining = self.ttl - elapsed;
                    warn!(
                        lease_id = format_args!("{:x}", self.lease_id),
                        error = %err,
                        remaining_ms = remaining.as_millis() as u64,
                        "keepalive failed, retrying"
                    );
                    delay = self.retry_interval.min(remaining);
                }
            }
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Session<S> {
    /// Grant a lease with the default TTL and start keeping it alive.
    pub async fn open(store: Arc<S>) -> Result<Self, CoordinationError> {
        Self::open_with_config(store, SessionConfig::default()).await
    }

    /// Grant (or attach to) a lease and start keeping it alive.
    ///
    /// Fails with [`CoordinationError::Connection`] when the store cannot be
    /// reached and [`CoordinationError::LeaseGrant`] when it refuses the lease.
    pub async fn open_with_config(store: Arc<S>, config: SessionConfig) -> Result<Self, CoordinationError> {
        let requested_ttl = config.requested_ttl();
        let request = match config.lease_id {
            Some(lease_id) => WriteRequest::lease_keepalive(lease_id),
            None => WriteRequest::lease_grant(0, requested_ttl),
        };

        let granted = match tokio::time::timeout(config.request_timeout, store.write(request)).await {
            Ok(Ok(result)) => result,
            Ok(Err(source)) if source.is_unavailable() => return Err(CoordinationError::Connection { source }),
            Ok(Err(source)) => return Err(CoordinationError::LeaseGrant { source }),
            Err(_) => {
                return Err(CoordinationError::Connection {
                    source: KeyValueStoreError::Timeout {
                        duration_ms: config.request_timeout.as_millis() as u64,
                    },
                });
            }
        };

        let lease_id = granted.lease_id.or(config.lease_id).ok_or_else(|| CoordinationError::LeaseGrant {
            source: KeyValueStoreError::Failed {
                reason: "lease response carried no lease id".to_string(),
            },
        })?;
        let ttl_seconds = granted.ttl_seconds.unwrap_or(requested_ttl);
        if ttl_seconds == 0 {
            return Err(CoordinationError::LeaseGrant {
                source: KeyValueStoreError::Failed {
                    reason: format!("lease {lease_id:x} granted with a zero TTL"),
                },
            });
        }
        let ttl = Duration::from_secs(u64::from(ttl_seconds));
        let interval = config.keepalive_interval_for(ttl);

        let (state_tx, _) = watch::channel(SessionState::Active);
        let state = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let keepalive = Keepalive {
            store: Arc::clone(&store),
            lease_id,
            ttl,
            interval,
            retry_interval: config.retry_interval,
            request_timeout: config.request_timeout,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(keepalive.run());

        info!(
            lease_id = format_args!("{lease_id:x}"),
            ttl_secs = ttl.as_secs(),
            attached = config.lease_id.is_some(),
            "session opened"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                store,
                lease_id,
                ttl,
                config,
                cancel,
                state,
                is_closed: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                keepalive: AsyncMutex::new(Some(task)),
            }),
        })
    }

    pub fn lease_id(&self) -> LeaseId {
        self.inner.lease_id
    }

    /// TTL granted by the store.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// True once the session has left `Active`.
    pub fn is_done(&self) -> bool {
        self.state() != SessionState::Active
    }

    /// Resolves when the session leaves `Active`, with the state it moved to.
    pub async fn done(&self) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|state| *state != SessionState::Active).await {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        }
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Send one keepalive now, outside the background schedule.
    pub async fn keep_alive_once(&self) -> Result<(), CoordinationError> {
        self.ensure_active()?;
        let result = send_keepalive(&*self.inner.store, self.inner.lease_id, self.inner.config.request_timeout).await;
        if let Err(CoordinationError::SessionExpired { .. }) = &result {
            leave_active(&self.inner.state, SessionState::Expired);
        }
        result
    }

    /// Stop keeping the lease alive and revoke it.
    ///
    /// Idempotent. A failed revoke is logged; the lease then expires on its
    /// TTL, which has the same effect on held keys.
    pub async fn close(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let task = self.inner.keepalive.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(lease_id = format_args!("{:x}", self.inner.lease_id), error = %err, "keepalive task failed");
            }
        }

        let lease_id = self.inner.lease_id;
        if !leave_active(&self.inner.state, SessionState::Closed) {
            info!(lease_id = format_args!("{lease_id:x}"), state = ?self.state(), "session closed after it ended");
            return;
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, self.inner.store.write(WriteRequest::lease_revoke(lease_id))).await {
            Ok(Ok(result)) => {
                info!(
                    lease_id = format_args!("{lease_id:x}"),
                    keys_deleted = result.keys_deleted.unwrap_or(0),
                    "session closed, lease revoked"
                );
            }
            Ok(Err(KeyValueStoreError::LeaseNotFound { .. })) => {
                info!(lease_id = format_args!("{lease_id:x}"), "session closed, lease already gone");
            }
            Ok(Err(err)) => {
                warn!(lease_id = format_args!("{lease_id:x}"), error = %err, "lease revoke failed, lease will expire on its TTL");
            }
            Err(_) => {
                warn!(
                    lease_id = format_args!("{lease_id:x}"),
                    timeout_ms = timeout.as_millis() as u64,
                    "lease revoke timed out, lease will expire on its TTL"
                );
            }
        }
    }

    /// Stop keepalives without revoking the lease.
    ///
    /// Keys stay in place until the lease runs out its TTL on the store.
    pub fn orphan(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        if leave_active(&self.inner.state, SessionState::Closed) {
            info!(lease_id = format_args!("{:x}", self.inner.lease_id), "session orphaned");
        }
    }

    /// Mutex over `prefix` bound to this session.
    pub fn new_mutex(&self, prefix: &str) -> Mutex<S> {
        Mutex::new(self.clone(), prefix)
    }

    /// Store-backed [`Locker`] over `prefix`.
    pub fn new_locker(&self, prefix: &str) -> Box<dyn Locker> {
        Box::new(self.new_mutex(prefix))
    }

    /// Election over `prefix` bound to this session.
    pub fn new_election(&self, prefix: &str) -> Election<S> {
        Election::new(self.clone(), prefix)
    }

    /// Election that picks up leadership recorded elsewhere.
    ///
    /// Nothing is checked here. `campaign`, `proclaim`, `resign` and
    /// `ensure_leader` first verify that `leader_key` still exists with
    /// `leader_rev` and fail with [`CoordinationError::LeaderChanged`]
    /// otherwise. `leader` and `observe` read the prefix without claiming
    /// leadership and leave the election `Resumed`.
    pub fn resume_election(&self, prefix: &str, leader_key: impl Into<String>, leader_rev: u64) -> Election<S> {
        Election::resume(self.clone(), prefix, leader_key.into(), leader_rev)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), CoordinationError> {
        if self.is_done() {
            return Err(CoordinationError::SessionExpired {
                lease_id: self.inner.lease_id,
            });
        }
        Ok(())
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }
}
