//! The store client trait consumed by the coordination primitives.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::kv::KeyValueStoreError;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WatchEvent;
use crate::kv::WatchRequest;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;

/// Stream of changes produced by [`KeyValueStore::watch`].
///
/// The stream ends when the store drops the subscription. An `Err` item
/// reports a broken subscription; callers resubscribe.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, KeyValueStoreError>>;

/// Strongly consistent key-value store with leases and change notification.
///
/// Implementations must be safe to share between many sessions. Writes are
/// linearizable and every mutation advances a single store-wide revision.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command: put, delete, transaction, or lease operation.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a value by key with revision metadata.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Ordered range read over a key prefix.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;

    /// Subscribe to changes on a key or prefix.
    ///
    /// Only changes applied after the subscription is registered are
    /// delivered. Callers that need to observe a transition re-read the key
    /// after subscribing.
    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        (**self).watch(request).await
    }
}
