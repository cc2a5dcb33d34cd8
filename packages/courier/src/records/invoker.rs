use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::field_matches;
use crate::storage::{Record, RecordKind};

/// An accepted inbound message awaiting delivery, keyed by payload key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerRecord {
    pub payload_key: String,
    pub message_id: Option<String>,
    pub sequence_id: String,
    pub message_number: u64,
    /// Set only after the application accepted the message.
    pub invoked: bool,
    pub received_at: DateTime<Utc>,
}

impl InvokerRecord {
    pub fn new(
        payload_key: impl Into<String>,
        sequence_id: impl Into<String>,
        message_number: u64,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload_key: payload_key.into(),
            message_id: None,
            sequence_id: sequence_id.into(),
            message_number,
            invoked: false,
            received_at,
        }
    }
}

/// Finder for [`InvokerRecord`].
#[derive(Debug, Clone, Default)]
pub struct InvokerFinder {
    pub sequence_id: Option<String>,
    pub message_number: Option<u64>,
    pub invoked: Option<bool>,
}

impl InvokerFinder {
    /// Records of `sequence_id` not yet delivered.
    pub fn pending(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: Some(sequence_id.into()),
            invoked: Some(false),
            ..Default::default()
        }
    }
}

impl Record for InvokerRecord {
    const KIND: RecordKind = RecordKind::Invoker;
    type Finder = InvokerFinder;

    fn key(&self) -> String {
        self.payload_key.clone()
    }

    fn matches(&self, finder: &InvokerFinder) -> bool {
        field_matches(&finder.sequence_id, &self.sequence_id)
            && field_matches(&finder.message_number, &self.message_number)
            && field_matches(&finder.invoked, &self.invoked)
    }
}
