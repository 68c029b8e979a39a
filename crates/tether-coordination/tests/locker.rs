//! The `Locker` seam: store-backed and in-process implementations behave alike.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tether_coordination::CoordinationError;
use tether_coordination::Locker;
use tether_coordination::Session;
use tether_testing::DeterministicKeyValueStore;
use tokio::sync::OwnedMutexGuard;

/// In-process stand-in for a distributed lock.
struct LocalLocker {
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LocalLocker {
    fn new(lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self { lock, guard: None }
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&mut self) -> Result<(), CoordinationError> {
        if self.guard.is_none() {
            self.guard = Some(Arc::clone(&self.lock).lock_owned().await);
        }
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), CoordinationError> {
        self.guard = None;
        Ok(())
    }
}

/// Increment `counter` inside the critical section `rounds` times.
async fn contend(mut locker: Box<dyn Locker>, busy: Arc<AtomicBool>, counter: Arc<AtomicU32>, rounds: u32) {
    for _ in 0..rounds {
        locker.lock().await.unwrap();
        assert!(!busy.swap(true, Ordering::SeqCst), "critical section entered twice");
        let seen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        counter.store(seen + 1, Ordering::SeqCst);
        busy.store(false, Ordering::SeqCst);
        locker.unlock().await.unwrap();
    }
}

async fn run_contenders(lockers: Vec<Box<dyn Locker>>, rounds: u32) -> u32 {
    let busy = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = lockers
        .into_iter()
        .map(|locker| tokio::spawn(contend(locker, busy.clone(), counter.clone(), rounds)))
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    counter.load(Ordering::SeqCst)
}

#[tokio::test]
async fn in_process_locker_serializes_contenders() {
    let shared = Arc::new(tokio::sync::Mutex::new(()));
    let lockers: Vec<Box<dyn Locker>> = (0..3).map(|_| Box::new(LocalLocker::new(shared.clone())) as Box<dyn Locker>).collect();

    assert_eq!(run_contenders(lockers, 5).await, 15);
}

#[tokio::test]
async fn store_locker_serializes_contenders() {
    let store = DeterministicKeyValueStore::new();
    let mut lockers = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = Session::open(store.clone()).await.unwrap();
        lockers.push(session.new_locker("locks/counter"));
        sessions.push(session);
    }

    assert_eq!(run_contenders(lockers, 5).await, 15);
    assert!(store.keys("locks/counter/").await.is_empty());
}

#[tokio::test]
async fn unlocking_an_unheld_locker_is_harmless() {
    let store = DeterministicKeyValueStore::new();
    let session = Session::open(store).await.unwrap();
    let mut lockers: Vec<Box<dyn Locker>> = vec![
        session.new_locker("locks/idle"),
        Box::new(LocalLocker::new(Arc::new(tokio::sync::Mutex::new(())))),
    ];

    for locker in &mut lockers {
        locker.unlock().await.unwrap();
    }
}
