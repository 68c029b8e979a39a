//! Read operation types for querying key-value state.

use serde::Deserialize;
use serde::Serialize;

use crate::KeyValueWithRevision;

/// Request to read a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Response from a read operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
    /// Store revision at which the read was served.
    pub header_revision: u64,
}

/// Request to delete a key from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
}

impl DeleteRequest {
    /// Create a delete request for the specified key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Ordering of scan results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanOrder {
    /// Lexicographic key order.
    #[default]
    Key,
    /// Oldest key first.
    CreateRevisionAscending,
    /// Newest key first.
    CreateRevisionDescending,
}

/// Ordered range read over a key prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub limit: Option<u32>,
    #[serde(default)]
    pub order: ScanOrder,
    /// Only return keys created at or before this revision.
    #[serde(default)]
    pub max_create_revision: Option<u64>,
}

impl ScanRequest {
    /// Scan every key under `prefix` in key order.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            limit: None,
            order: ScanOrder::Key,
            max_create_revision: None,
        }
    }

    /// The single oldest key under `prefix`.
    ///
    /// This is the current owner of a lock or election prefix.
    pub fn first_created(prefix: impl Into<String>) -> Self {
        Self::prefix(prefix).with_order(ScanOrder::CreateRevisionAscending).with_limit(1)
    }

    /// The newest key under `prefix` created at or before `max_create_revision`.
    ///
    /// For a candidate created at revision `r`, passing `r - 1` yields its
    /// immediate predecessor.
    pub fn last_created_before(prefix: impl Into<String>, max_create_revision: u64) -> Self {
        Self::prefix(prefix)
            .with_order(ScanOrder::CreateRevisionDescending)
            .with_limit(1)
            .with_max_create_revision(max_create_revision)
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_max_create_revision(mut self, revision: u64) -> Self {
        self.max_create_revision = Some(revision);
        self
    }
}

/// Response from a scan operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub entries: Vec<KeyValueWithRevision>,
    pub count: u32,
    pub is_truncated: bool,
    /// Store revision at which the scan was served.
    pub header_revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_new() {
        let req = ReadRequest::new("key");
        assert_eq!(req.key, "key");
    }

    #[test]
    fn scan_order_default_is_key() {
        assert_eq!(ScanOrder::default(), ScanOrder::Key);
        assert_eq!(ScanRequest::prefix("p/").order, ScanOrder::Key);
    }

    #[test]
    fn first_created_is_single_oldest() {
        let req = ScanRequest::first_created("locks/a/");
        assert_eq!(req.prefix, "locks/a/");
        assert_eq!(req.limit, Some(1));
        assert_eq!(req.order, ScanOrder::CreateRevisionAscending);
        assert_eq!(req.max_create_revision, None);
    }

    #[test]
    fn last_created_before_bounds_revision() {
        let req = ScanRequest::last_created_before("locks/a/", 41);
        assert_eq!(req.limit, Some(1));
        assert_eq!(req.order, ScanOrder::CreateRevisionDescending);
        assert_eq!(req.max_create_revision, Some(41));
    }

    #[test]
    fn scan_request_missing_optional_fields_deserialize() {
        let req: ScanRequest = serde_json::from_str(r#"{"prefix":"a/","limit":null}"#).unwrap();
        assert_eq!(req, ScanRequest::prefix("a/"));
    }
}
