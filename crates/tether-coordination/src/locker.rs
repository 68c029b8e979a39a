//! Object-safe lock interface.

use async_trait::async_trait;
use tether_core::KeyValueStore;

use crate::error::CoordinationError;
use crate::mutex::Mutex;

/// Something that can be locked and unlocked.
///
/// The store-backed [`Mutex`] is one implementation. Code that only needs
/// mutual exclusion can take a `Box<dyn Locker>` and run against an
/// in-process lock in tests.
#[async_trait]
pub trait Locker: Send {
    /// Block until the lock is held.
    async fn lock(&mut self) -> Result<(), CoordinationError>;

    /// Release the lock. Releasing an unheld lock is a no-op.
    async fn unlock(&mut self) -> Result<(), CoordinationError>;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized + 'static> Locker for Mutex<S> {
    async fn lock(&mut self) -> Result<(), CoordinationError> {
        Mutex::lock(self, None).await
    }

    async fn unlock(&mut self) -> Result<(), CoordinationError> {
        Mutex::unlock(self).await
    }
}
