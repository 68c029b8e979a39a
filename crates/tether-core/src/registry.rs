//! Named store client registry.
//!
//! Built once at process startup and passed by reference to everything that
//! needs a store. Lookups fall back to the `"default"` client when no name is
//! given. Asking for a name that was never registered is a configuration
//! mistake and is reported as [`RegistryError::UnknownClient`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::info;

use crate::config::ConfigError;
use crate::config::CoordinationConfig;
use crate::config::SessionSettings;
use crate::config::StoreConfig;
use crate::constants::DEFAULT_CLIENT_NAME;
use crate::kv::KeyValueStoreError;
use crate::traits::KeyValueStore;

/// Turns a [`StoreConfig`] into a live store client.
///
/// The transport, TLS and authentication all live behind this trait.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// The client type this connector produces.
    type Store: KeyValueStore + ?Sized;

    /// Connect to the cluster described by `config`.
    async fn connect(&self, name: &str, config: &StoreConfig) -> Result<Arc<Self::Store>, KeyValueStoreError>;
}

/// Errors from building or querying a [`ClientRegistry`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// No client is registered under `name`.
    #[snafu(display("store client not found: {name}"))]
    UnknownClient {
        /// The requested name.
        name: String,
    },

    /// Connecting a configured client failed.
    #[snafu(display("failed to connect store client '{name}': {source}"))]
    Connect {
        /// The client being connected.
        name: String,
        /// The connector's error.
        source: KeyValueStoreError,
    },

    /// The configuration did not validate.
    #[snafu(display("invalid registry configuration: {source}"))]
    InvalidConfig {
        /// The validation error.
        source: ConfigError,
    },
}

/// Process-wide mapping from client name to store handle.
pub struct ClientRegistry<S: KeyValueStore + ?Sized> {
    clients: BTreeMap<String, Arc<S>>,
    session: SessionSettings,
}

impl<S: KeyValueStore + ?Sized> std::fmt::Debug for ClientRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("session", &self.session)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized> ClientRegistry<S> {
    /// Validate `config` and connect every configured client.
    ///
    /// Fails on the first client that cannot be connected; nothing is
    /// registered in that case.
    pub async fn connect<C>(connector: &C, config: &CoordinationConfig) -> Result<Self, RegistryError>
    where C: StoreConnector<Store = S> {
        config.validate().map_err(|source| RegistryError::InvalidConfig { source })?;

        let mut clients = BTreeMap::new();
        for (name, store_config) in &config.clients {
            let client = connector
                .connect(name, store_config)
                .await
                .map_err(|source| RegistryError::Connect {
                    name: name.clone(),
                    source,
                })?;
            info!(client = %name, endpoints = ?store_config.endpoints, "store client registered");
            clients.insert(name.clone(), client);
        }

        Ok(Self {
            clients,
            session: config.session.clone(),
        })
    }

    /// Build a registry from already connected clients.
    pub fn from_clients(clients: impl IntoIterator<Item = (String, Arc<S>)>, session: SessionSettings) -> Self {
        Self {
            clients: clients.into_iter().collect(),
            session,
        }
    }

    /// Client registered under `name`, or the default client when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<S>, RegistryError> {
        let name = name.unwrap_or(DEFAULT_CLIENT_NAME);
        self.clients.get(name).cloned().ok_or_else(|| RegistryError::UnknownClient { name: name.to_string() })
    }

    /// Session defaults from the configuration the registry was built with.
    pub fn session_settings(&self) -> &SessionSettings {
        &self.session
    }

    /// Registered client names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
