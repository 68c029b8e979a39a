//! Candidate key layout under a lock or election prefix.
//!
//! Keys look like `<prefix>/<lease id in hex>_<sequence>`. The sequence is
//! per session, so one session can hold several mutexes on one prefix
//! without their keys colliding.

use tether_core::kv::LeaseId;

/// Ensure `prefix` ends with exactly one `/`.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    format!("{trimmed}/")
}

/// Key for candidate `sequence` of `lease_id` under a normalized prefix.
pub(crate) fn candidate_key(prefix: &str, lease_id: LeaseId, sequence: u64) -> String {
    format!("{prefix}{lease_id:x}_{sequence}")
}
