use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::field_matches;
use crate::storage::{Record, RecordKind};

/// Opaque message body stored alongside the records that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPayload {
    pub key: String,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl StoredPayload {
    /// Store `body` under a fresh key.
    pub fn new(body: Bytes, stored_at: DateTime<Utc>) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            body,
            stored_at,
        }
    }
}

/// Finder for [`StoredPayload`].
#[derive(Debug, Clone, Default)]
pub struct PayloadFinder {
    pub key: Option<String>,
}

impl Record for StoredPayload {
    const KIND: RecordKind = RecordKind::Payload;
    type Finder = PayloadFinder;

    fn key(&self) -> String {
        self.key.clone()
    }

    fn matches(&self, finder: &PayloadFinder) -> bool {
        field_matches(&finder.key, &self.key)
    }
}
