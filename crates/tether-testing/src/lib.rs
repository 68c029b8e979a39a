//! Testing infrastructure for the coordination crates.
//!
//! - [`DeterministicKeyValueStore`]: in-memory store with leases, watches,
//!   transactions and fault injection
//! - [`DeterministicConnector`]: [`StoreConnector`] that hands out one
//!   deterministic store per client name
//! - [`init_tracing`]: idempotent subscriber setup honoring `RUST_LOG`

mod store;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tether_core::StoreConfig;
use tether_core::StoreConnector;
use tether_core::kv::KeyValueStoreError;
use tracing_subscriber::EnvFilter;

pub use store::DeterministicKeyValueStore;

/// Install a test subscriber once per process. Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Connector backed by [`DeterministicKeyValueStore`].
///
/// Every client name gets its own store. Names marked unreachable fail to
/// connect with `Unavailable`.
#[derive(Default)]
pub struct DeterministicConnector {
    unreachable: BTreeSet<String>,
    stores: Mutex<BTreeMap<String, Arc<DeterministicKeyValueStore>>>,
}

impl DeterministicConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections for client `name`.
    pub fn with_unreachable(mut self, name: impl Into<String>) -> Self {
        self.unreachable.insert(name.into());
        self
    }

    /// The store handed out for `name`, if one was connected.
    pub fn store(&self, name: &str) -> Option<Arc<DeterministicKeyValueStore>> {
        self.stores.lock().ok()?.get(name).cloned()
    }
}

#[async_trait]
impl StoreConnector for DeterministicConnector {
    type Store = DeterministicKeyValueStore;

    async fn connect(&self, name: &str, config: &StoreConfig) -> Result<Arc<Self::Store>, KeyValueStoreError> {
        if self.unreachable.contains(name) || config.endpoints.is_empty() {
            return Err(KeyValueStoreError::Unavailable {
                reason: format!("no reachable endpoint for client '{name}'"),
            });
        }
        let store = DeterministicKeyValueStore::new();
        if let Ok(mut stores) = self.stores.lock() {
            stores.insert(name.to_string(), store.clone());
        }
        Ok(store)
    }
}
