//! Store client boundary for Tether coordination.
//!
//! The coordination primitives never talk to the network themselves. They
//! consume a [`KeyValueStore`], which exposes the four things a strongly
//! consistent store has to provide:
//!
//! - atomic compare/then/else transactions
//! - ordered range reads over a key prefix
//! - a change-notification stream filtered by key or prefix
//! - lease grant, keepalive and revoke
//!
//! The crate also carries the connection configuration surface
//! ([`config::CoordinationConfig`]) and an explicit named client registry
//! ([`registry::ClientRegistry`]) that is built once at startup and passed by
//! reference to whatever needs a store.

pub mod config;
pub mod constants;
pub mod kv;
pub mod registry;
mod traits;

pub use config::ConfigError;
pub use config::CoordinationConfig;
pub use config::SessionSettings;
pub use config::StoreConfig;
pub use kv::*;
pub use registry::ClientRegistry;
pub use registry::RegistryError;
pub use registry::StoreConnector;
pub use traits::KeyValueStore;
pub use traits::WatchStream;
