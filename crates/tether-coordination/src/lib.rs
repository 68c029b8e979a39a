//! Session-scoped coordination primitives over a consistent key-value store.
//!
//! - [`Session`]: a store lease kept alive by a background task; the
//!   liveness every other primitive inherits
//! - [`Mutex`]: FIFO mutual exclusion ordered by key create revision
//! - [`Election`]: leader election with campaign, proclaim, resign, resume
//!   and observe
//! - [`Locker`]: object-safe lock interface, implemented by [`Mutex`]
//!
//! All keys a primitive writes are attached to its session's lease. When a
//! process dies its lease expires, the store deletes its keys, and the next
//! waiter in line proceeds.
//!
//! ## Lock Example
//!
//! ```ignore
//! use tether_coordination::Session;
//!
//! let session = Session::open(store).await?;
//! let mut mutex = session.new_mutex("locks/schema-migration");
//! mutex.lock(Some(Duration::from_secs(30))).await?;
//! // critical section; fence writes with mutex.is_owner_cmp()
//! mutex.unlock().await?;
//! session.close().await;
//! ```
//!
//! ## Election Example
//!
//! ```ignore
//! let mut election = session.new_election("elections/scheduler");
//! election.campaign("10.0.0.7:7000", None).await?;
//! assert!(election.is_leader());
//!
//! // elsewhere
//! let leader = election.leader().await?;
//! ```

mod election;
mod error;
mod keys;
mod locker;
mod mutex;
mod observe;
mod session;
mod wait;

pub use election::Election;
pub use election::ElectionState;
pub use election::LeaderRecord;
pub use error::CoordinationError;
pub use locker::Locker;
pub use mutex::Mutex;
pub use observe::LeaderObserver;
pub use session::Session;
pub use session::SessionConfig;
pub use session::SessionState;
use tether_core::ClientRegistry;
use tether_core::KeyValueStore;
use tether_core::RegistryError;

/// Open a session on the client registered as `name`, or the default client.
///
/// Uses the registry's session settings for TTL and timeouts.
pub async fn open_session<S: KeyValueStore + ?Sized + 'static>(
    registry: &ClientRegistry<S>,
    name: Option<&str>,
) -> Result<Session<S>, CoordinationError> {
    let store = registry.get(name).map_err(|err| match err {
        RegistryError::UnknownClient { name } => CoordinationError::UnknownClient { name },
        other => CoordinationError::Storage {
            source: tether_core::kv::KeyValueStoreError::Failed {
                reason: other.to_string(),
            },
        },
    })?;
    Session::open_with_config(store, SessionConfig::from_settings(registry.session_settings())).await
}
