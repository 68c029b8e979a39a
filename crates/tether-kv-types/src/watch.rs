//! Change-notification subscription types.

use serde::Deserialize;
use serde::Serialize;

use crate::KeyValueWithRevision;

/// Subscribe to changes of one key or of every key under a prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: String,
    pub is_prefix: bool,
}

impl WatchRequest {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_prefix: false,
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            key: prefix.into(),
            is_prefix: true,
        }
    }

    /// Returns true if a change to `key` is covered by this subscription.
    pub fn matches(&self, key: &str) -> bool {
        if self.is_prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change delivered to a watcher.
///
/// For deletes `kv` holds the key and the last known metadata, with
/// `mod_revision` set to the revision of the delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValueWithRevision,
}

impl WatchEvent {
    pub fn is_delete(&self) -> bool {
        self.kind == WatchEventKind::Delete
    }
}
