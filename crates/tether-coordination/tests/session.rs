//! Session lifecycle against the deterministic store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_coordination::CoordinationError;
use tether_coordination::Session;
use tether_coordination::SessionConfig;
use tether_coordination::SessionState;
use tether_core::KeyValueStore;
use tether_core::WatchStream;
use tether_core::kv::KeyValueStoreError;
use tether_core::kv::ReadRequest;
use tether_core::kv::ReadResult;
use tether_core::kv::ScanRequest;
use tether_core::kv::ScanResult;
use tether_core::kv::WatchRequest;
use tether_core::kv::WriteCommand;
use tether_core::kv::WriteRequest;
use tether_core::kv::WriteResult;
use tether_testing::DeterministicKeyValueStore;
use tether_testing::init_tracing;
use tokio::time::Instant;

#[tokio::test]
async fn open_grants_lease_and_close_revokes_it() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();

    assert_eq!(store.lease_ids().await, vec![session.lease_id()]);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.ttl(), Duration::from_secs(60));

    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_done());
    assert!(store.lease_ids().await.is_empty());
}

#[tokio::test]
async fn close_is_idempotent_across_clones() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();
    let other = session.clone();

    tokio::join!(session.close(), other.close());
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(store.lease_ids().await.is_empty());
}

#[tokio::test]
async fn close_deletes_keys_owned_by_the_session() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();
    let mut mutex = session.new_mutex("locks/reports");
    mutex.lock(None).await.unwrap();
    assert_eq!(store.keys("locks/reports/").await.len(), 1);

    session.close().await;

    assert!(store.keys("locks/reports/").await.is_empty());
}

#[tokio::test]
async fn open_fails_with_connection_error_when_unreachable() {
    let store = DeterministicKeyValueStore::new();
    store.set_unavailable(true);

    match Session::open(store).await {
        Err(CoordinationError::Connection { source }) => assert!(source.is_unavailable()),
        other => panic!("expected Connection, got {other:?}"),
    }
}

#[tokio::test]
async fn attaching_to_a_missing_lease_is_a_grant_error() {
    let store = DeterministicKeyValueStore::new();
    let config = SessionConfig::default().with_lease(0xdead);

    match Session::open_with_config(store, config).await {
        Err(CoordinationError::LeaseGrant { source }) => {
            assert_eq!(source, KeyValueStoreError::LeaseNotFound { lease_id: 0xdead });
        }
        other => panic!("expected LeaseGrant, got {other:?}"),
    }
}

#[tokio::test]
async fn attaches_to_an_existing_lease() {
    let store = DeterministicKeyValueStore::new();
    let granted = store.write(WriteRequest::lease_grant(0, 30)).await.unwrap();
    let lease_id = granted.lease_id.unwrap();

    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_lease(lease_id))
        .await
        .unwrap();

    assert_eq!(session.lease_id(), lease_id);
    assert_eq!(session.ttl(), Duration::from_secs(30));
    assert_eq!(store.lease_ids().await, vec![lease_id]);
}

#[tokio::test(start_paused = true)]
async fn keepalive_holds_the_lease_past_its_ttl() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(3)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(store.lease_ids().await, vec![session.lease_id()]);
}

#[tokio::test(start_paused = true)]
async fn lost_keepalives_expire_the_session_after_one_ttl() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(5)).await.unwrap();
    let start = Instant::now();
    let mut states = session.subscribe_state();

    store.set_keepalive_failures(true);
    let state = session.done().await;

    assert_eq!(state, SessionState::Expired);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "expired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "expired too late: {elapsed:?}");

    states.changed().await.unwrap();
    assert_eq!(*states.borrow(), SessionState::Expired);
    assert!(store.lease_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_keepalive_failures_are_retried() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(6)).await.unwrap();

    store.set_keepalive_failures(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    store.set_keepalive_failures(false);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(store.lease_ids().await, vec![session.lease_id()]);
}

#[tokio::test(start_paused = true)]
async fn store_side_expiry_is_noticed_on_the_next_keepalive() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(9)).await.unwrap();

    assert!(store.expire_lease(session.lease_id()).await);

    assert_eq!(session.done().await, SessionState::Expired);
}

#[tokio::test]
async fn keep_alive_once_reports_a_vanished_lease() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();
    session.keep_alive_once().await.unwrap();

    store.expire_lease(session.lease_id()).await;

    assert!(matches!(
        session.keep_alive_once().await,
        Err(CoordinationError::SessionExpired { lease_id }) if lease_id == session.lease_id()
    ));
    assert_eq!(session.state(), SessionState::Expired);
}

#[tokio::test]
async fn keep_alive_once_reports_refresh_failures() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();

    store.set_keepalive_failures(true);

    assert!(matches!(session.keep_alive_once().await, Err(CoordinationError::LeaseRefresh { .. })));
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn orphan_leaves_the_lease_to_expire() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(2)).await.unwrap();
    let mut mutex = session.new_mutex("locks/orphan");
    mutex.lock(None).await.unwrap();

    session.orphan();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(store.keys("locks/orphan/").await, vec![mutex.key().to_string()]);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(store.keys("locks/orphan/").await.is_empty());
    assert!(store.lease_ids().await.is_empty());
}

#[tokio::test]
async fn closed_session_refuses_new_work() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store).await.unwrap();
    session.close().await;

    let mut mutex = session.new_mutex("locks/late");
    assert!(matches!(mutex.lock(None).await, Err(CoordinationError::SessionExpired { .. })));

    let mut election = session.new_election("elections/late");
    assert!(matches!(election.campaign("v", None).await, Err(CoordinationError::SessionExpired { .. })));
}

#[tokio::test]
async fn close_after_store_loss_does_not_fail() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store.clone()).await.unwrap();

    store.set_unavailable(true);
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    store.set_unavailable(false);
    // The revoke was lost, so the lease lives on until its TTL.
    assert_eq!(store.lease_ids().await, vec![session.lease_id()]);
}

/// Store whose lease keepalives panic, taking the keepalive task down.
struct PanickingKeepalives(Arc<DeterministicKeyValueStore>);

#[async_trait]
impl KeyValueStore for PanickingKeepalives {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        if matches!(request.command, WriteCommand::LeaseKeepalive { .. }) {
            panic!("keepalive handler crashed");
        }
        self.0.write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.0.read(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        self.0.scan(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        self.0.watch(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn close_survives_a_crashed_keepalive_task() {
    let inner = DeterministicKeyValueStore::new();
    let store = Arc::new(PanickingKeepalives(inner.clone()));
    let session = Session::open_with_config(store, SessionConfig::default().with_ttl(3)).await.unwrap();

    // Past the first keepalive, which panics inside the task.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(inner.lease_ids().await.is_empty());
}
