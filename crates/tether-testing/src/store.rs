//! Deterministic in-memory store.
//!
//! Implements the full [`KeyValueStore`] contract in one process: a single
//! store-wide revision, create/mod revisions per key, leases that expire on
//! tokio time, transactions, ordered scans and key/prefix watches. Lease
//! deadlines use `tokio::time::Instant`, so tests running with paused time
//! can drive expiry without real sleeps.
//!
//! Faults are injected with [`DeterministicKeyValueStore::set_unavailable`]
//! and [`DeterministicKeyValueStore::set_keepalive_failures`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tether_core::KeyValueStore;
use tether_core::WatchStream;
use tether_core::kv::KeyValueStoreError;
use tether_core::kv::KeyValueWithRevision;
use tether_core::kv::LeaseId;
use tether_core::kv::ReadRequest;
use tether_core::kv::ReadResult;
use tether_core::kv::ScanOrder;
use tether_core::kv::ScanRequest;
use tether_core::kv::ScanResult;
use tether_core::kv::TxnCompare;
use tether_core::kv::TxnOp;
use tether_core::kv::TxnOpResult;
use tether_core::kv::WatchEvent;
use tether_core::kv::WatchEventKind;
use tether_core::kv::WatchRequest;
use tether_core::kv::WriteCommand;
use tether_core::kv::WriteRequest;
use tether_core::kv::WriteResult;
use tether_core::kv::validate_write_command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// How often the background reaper looks for expired leases.
const REAPER_TICK: Duration = Duration::from_millis(50);

/// First identifier handed out for `LeaseGrant { lease_id: 0, .. }`.
const FIRST_LEASE_ID: LeaseId = 0x1000;

/// Versioned value for tracking revisions.
#[derive(Clone)]
struct VersionedValue {
    value: String,
    create_revision: u64,
    mod_revision: u64,
    version: u64,
    lease_id: Option<LeaseId>,
}

struct LeaseEntry {
    ttl_seconds: u32,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    request: WatchRequest,
    tx: mpsc::UnboundedSender<Result<WatchEvent, KeyValueStoreError>>,
}

struct StoreState {
    data: BTreeMap<String, VersionedValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    revision: u64,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            leases: HashMap::new(),
            revision: 0,
            next_lease_id: FIRST_LEASE_ID,
            watchers: Vec::new(),
        }
    }

    fn entry(key: &str, versioned: &VersionedValue) -> KeyValueWithRevision {
        KeyValueWithRevision {
            key: key.to_string(),
            value: versioned.value.clone(),
            version: versioned.version,
            create_revision: versioned.create_revision,
            mod_revision: versioned.mod_revision,
            lease_id: versioned.lease_id,
        }
    }

    fn get(&self, key: &str) -> Option<KeyValueWithRevision> {
        self.data.get(key).map(|v| Self::entry(key, v))
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if watcher.tx.is_closed() {
                return false;
            }
            if !watcher.request.matches(&event.kv.key) {
                return true;
            }
            watcher.tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn check_lease(&self, lease_id: Option<LeaseId>) -> Result<(), KeyValueStoreError> {
        match lease_id {
            Some(id) if !self.leases.contains_key(&id) => Err(KeyValueStoreError::LeaseNotFound { lease_id: id }),
            _ => Ok(()),
        }
    }

    /// Caller must have validated the lease and advanced the revision.
    fn put(&mut self, key: &str, value: &str, lease_id: Option<LeaseId>) {
        let revision = self.revision;
        let (create_revision, version, previous_lease) = match self.data.get(key) {
            Some(old) => (old.create_revision, old.version + 1, old.lease_id),
            None => (revision, 1, None),
        };
        if previous_lease != lease_id {
            if let Some(old) = previous_lease.and_then(|id| self.leases.get_mut(&id)) {
                old.keys.remove(key);
            }
        }
        if let Some(lease) = lease_id.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.insert(key.to_string());
        }

        let versioned = VersionedValue {
            value: value.to_string(),
            create_revision,
            mod_revision: revision,
            version,
            lease_id,
        };
        let kv = Self::entry(key, &versioned);
        self.data.insert(key.to_string(), versioned);
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });
    }

    /// Caller must have advanced the revision.
    fn delete(&mut self, key: &str) -> bool {
        let Some(old) = self.data.remove(key) else {
            return false;
        };
        if let Some(lease) = old.lease_id.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        let mut kv = Self::entry(key, &old);
        kv.mod_revision = self.revision;
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            kv,
        });
        true
    }

    /// Remove a lease and every key attached to it. Returns the number of keys deleted.
    fn revoke(&mut self, lease_id: LeaseId) -> Option<u32> {
        let lease = self.leases.remove(&lease_id)?;
        if lease.keys.is_empty() {
            return Some(0);
        }
        self.revision += 1;
        let mut deleted = 0;
        for key in &lease.keys {
            if self.delete(key) {
                deleted += 1;
            }
        }
        Some(deleted)
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> =
            self.leases.iter().filter(|(_, lease)| lease.deadline <= now).map(|(id, _)| *id).collect();
        for lease_id in expired {
            let deleted = self.revoke(lease_id).unwrap_or(0);
            debug!(lease_id = format_args!("{lease_id:x}"), keys_deleted = deleted, "lease expired");
        }
    }

    fn scan(&self, prefix: &str, limit: Option<u32>, order: ScanOrder, max_create_revision: Option<u64>) -> (Vec<KeyValueWithRevision>, bool) {
        let mut entries: Vec<KeyValueWithRevision> = self
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| max_create_revision.is_none_or(|max| v.create_revision <= max))
            .map(|(k, v)| Self::entry(k, v))
            .collect();

        match order {
            ScanOrder::Key => {}
            ScanOrder::CreateRevisionAscending => entries.sort_by_key(|kv| kv.create_revision),
            ScanOrder::CreateRevisionDescending => entries.sort_by(|a, b| b.create_revision.cmp(&a.create_revision)),
        }

        // A limit of 0 means unlimited.
        let limit = limit.filter(|l| *l > 0).map(|l| l as usize).unwrap_or(usize::MAX);
        let is_truncated = entries.len() > limit;
        entries.truncate(limit);
        (entries, is_truncated)
    }

    fn compare(&self, cmp: &TxnCompare) -> bool {
        use tether_core::kv::CompareTarget;

        let actual = self.data.get(&cmp.key);
        match cmp.target {
            CompareTarget::Value => cmp.matches_str(actual.map(|v| v.value.as_str()).unwrap_or("")),
            CompareTarget::Version => cmp.matches_u64(actual.map(|v| v.version).unwrap_or(0)),
            CompareTarget::CreateRevision => cmp.matches_u64(actual.map(|v| v.create_revision).unwrap_or(0)),
            CompareTarget::ModRevision => cmp.matches_u64(actual.map(|v| v.mod_revision).unwrap_or(0)),
        }
    }

    fn transaction(&mut self, compare: &[TxnCompare], success: &[TxnOp], failure: &[TxnOp]) -> Result<WriteResult, KeyValueStoreError> {
        let succeeded = compare.iter().all(|cmp| self.compare(cmp));
        let ops = if succeeded { success } else { failure };

        // Validate before mutating so a failed transaction leaves no trace.
        for op in ops {
            if let TxnOp::Put { lease_id, .. } = op {
                self.check_lease(*lease_id)?;
            }
        }
        let writes = ops.iter().any(|op| match op {
            TxnOp::Put { .. } => true,
            TxnOp::Delete { key } => self.data.contains_key(key),
            TxnOp::Get { .. } | TxnOp::Range { .. } => false,
        });
        if writes {
            self.revision += 1;
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                TxnOp::Put { key, value, lease_id } => {
                    self.put(key, value, *lease_id);
                    TxnOpResult::Put {
                        revision: self.revision,
                    }
                }
                TxnOp::Delete { key } => TxnOpResult::Delete {
                    deleted: u32::from(self.delete(key)),
                },
                TxnOp::Get { key } => TxnOpResult::Get { kv: self.get(key) },
                TxnOp::Range { prefix, limit, order } => {
                    let (kvs, more) = self.scan(prefix, Some(*limit), *order, None);
                    TxnOpResult::Range { kvs, more }
                }
            };
            results.push(result);
        }

        Ok(WriteResult {
            succeeded: Some(succeeded),
            txn_results: Some(results),
            header_revision: Some(self.revision),
            ..WriteResult::default()
        })
    }
}

/// A deterministic in-memory key-value store for testing.
///
/// Thread-safe; clones of the returned `Arc` share one keyspace.
pub struct DeterministicKeyValueStore {
    state: Mutex<StoreState>,
    is_unavailable: AtomicBool,
    is_failing_keepalives: AtomicBool,
    is_reaper_started: AtomicBool,
    me: Weak<DeterministicKeyValueStore>,
}

impl std::fmt::Debug for DeterministicKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicKeyValueStore")
            .field("is_unavailable", &self.is_unavailable.load(Ordering::Relaxed))
            .field("is_failing_keepalives", &self.is_failing_keepalives.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeterministicKeyValueStore {
    /// Create a new deterministic store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(StoreState::new()),
            is_unavailable: AtomicBool::new(false),
            is_failing_keepalives: AtomicBool::new(false),
            is_reaper_started: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Make every request fail with `Unavailable`, as if the network were down.
    pub fn set_unavailable(&self, is_unavailable: bool) {
        self.is_unavailable.store(is_unavailable, Ordering::SeqCst);
    }

    /// Make lease keepalives fail while everything else keeps working.
    ///
    /// Leases are not refreshed while this is set, so they expire on the
    /// store after their TTL.
    pub fn set_keepalive_failures(&self, is_failing: bool) {
        self.is_failing_keepalives.store(is_failing, Ordering::SeqCst);
    }

    /// Expire a lease immediately, deleting its keys. Returns false if unknown.
    pub async fn expire_lease(&self, lease_id: LeaseId) -> bool {
        let mut state = self.state.lock().await;
        state.revoke(lease_id).is_some()
    }

    /// Identifiers of all live leases.
    pub async fn lease_ids(&self) -> Vec<LeaseId> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        let mut ids: Vec<LeaseId> = state.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Keys under `prefix` in create-revision order.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        let (entries, _) = state.scan(prefix, None, ScanOrder::CreateRevisionAscending, None);
        entries.into_iter().map(|kv| kv.key).collect()
    }

    /// The store-wide revision.
    pub async fn current_revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    fn check_available(&self) -> Result<(), KeyValueStoreError> {
        if self.is_unavailable.load(Ordering::SeqCst) {
            return Err(KeyValueStoreError::Unavailable {
                reason: "injected fault: store unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_reaper(&self) {
        if self.is_reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_TICK).await;
                let Some(store) = me.upgrade() else {
                    break;
                };
                store.state.lock().await.expire_leases(Instant::now());
            }
        });
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        self.check_available()?;
        validate_write_command(&request.command)?;

        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());

        match request.command {
            WriteCommand::Set { key, value } => {
                state.revision += 1;
                state.put(&key, &value, None);
                Ok(WriteResult {
                    header_revision: Some(state.revision),
                    ..WriteResult::default()
                })
            }
            WriteCommand::SetWithLease { key, value, lease_id } => {
                state.check_lease(Some(lease_id))?;
                state.revision += 1;
                state.put(&key, &value, Some(lease_id));
                Ok(WriteResult {
                    header_revision: Some(state.revision),
                    lease_id: Some(lease_id),
                    ..WriteResult::default()
                })
            }
            WriteCommand::Delete { key } => {
                let exists = state.data.contains_key(&key);
                if exists {
                    state.revision += 1;
                    state.delete(&key);
                }
                Ok(WriteResult {
                    header_revision: Some(state.revision),
                    keys_deleted: Some(u32::from(exists)),
                    ..WriteResult::default()
                })
            }
            WriteCommand::Transaction {
                compare,
                success,
                failure,
            } => state.transaction(&compare, &success, &failure),
            WriteCommand::LeaseGrant { lease_id, ttl_seconds } => {
                let lease_id = if lease_id == 0 {
                    let id = state.next_lease_id;
                    state.next_lease_id += 1;
                    id
                } else {
                    lease_id
                };
                if state.leases.contains_key(&lease_id) {
                    return Err(KeyValueStoreError::Failed {
                        reason: format!("lease {lease_id:x} already exists"),
                    });
                }
                if ttl_seconds == 0 {
                    return Err(KeyValueStoreError::Failed {
                        reason: "lease TTL must be positive".to_string(),
                    });
                }
                state.leases.insert(lease_id, LeaseEntry {
                    ttl_seconds,
                    deadline: Instant::now() + Duration::from_secs(u64::from(ttl_seconds)),
                    keys: BTreeSet::new(),
                });
                drop(state);
                self.ensure_reaper();
                Ok(WriteResult {
                    lease_id: Some(lease_id),
                    ttl_seconds: Some(ttl_seconds),
                    ..WriteResult::default()
                })
            }
            WriteCommand::LeaseRevoke { lease_id } => {
                let deleted = state.revoke(lease_id).ok_or(KeyValueStoreError::LeaseNotFound { lease_id })?;
                Ok(WriteResult {
                    header_revision: Some(state.revision),
                    lease_id: Some(lease_id),
                    keys_deleted: Some(deleted),
                    ..WriteResult::default()
                })
            }
            WriteCommand::LeaseKeepalive { lease_id } => {
                if self.is_failing_keepalives.load(Ordering::SeqCst) {
                    return Err(KeyValueStoreError::Unavailable {
                        reason: "injected fault: keepalive dropped".to_string(),
                    });
                }
                let lease = state.leases.get_mut(&lease_id).ok_or(KeyValueStoreError::LeaseNotFound { lease_id })?;
                lease.deadline = Instant::now() + Duration::from_secs(u64::from(lease.ttl_seconds));
                Ok(WriteResult {
                    lease_id: Some(lease_id),
                    ttl_seconds: Some(lease.ttl_seconds),
                    ..WriteResult::default()
                })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        Ok(ReadResult {
            kv: state.get(&request.key),
            header_revision: state.revision,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        let (entries, is_truncated) =
            state.scan(&request.prefix, request.limit, request.order, request.max_create_revision);
        Ok(ScanResult {
            count: entries.len() as u32,
            entries,
            is_truncated,
            header_revision: state.revision,
        })
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push(Watcher { request, tx });
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}
