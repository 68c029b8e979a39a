//! Fixed defaults for sessions and the client registry.
//!
//! Each constant has an explicit bound so nothing grows without limit.

/// Lease TTL used when a session is opened without an explicit TTL.
pub const DEFAULT_SESSION_TTL_SECS: u32 = 60;

/// Smallest TTL a session will request.
pub const MIN_SESSION_TTL_SECS: u32 = 1;

/// Keepalives are sent every `ttl / KEEPALIVE_INTERVAL_DIVISOR`.
pub const KEEPALIVE_INTERVAL_DIVISOR: u32 = 3;

/// Floor for any keepalive interval, in milliseconds.
pub const MIN_KEEPALIVE_INTERVAL_MS: u64 = 1;

/// Delay between keepalive retries after a failed send.
pub const DEFAULT_KEEPALIVE_RETRY_MS: u64 = 500;

/// Upper bound on a single lease request (grant, keepalive, revoke).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Registry name used when the caller does not name a client.
pub const DEFAULT_CLIENT_NAME: &str = "default";

/// Buffered leadership notifications per observer.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 16;

/// Default dial timeout for store connections, in seconds.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;
