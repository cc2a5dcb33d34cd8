use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{field_matches, optional_matches};
use crate::storage::{Record, RecordKind};

/// Correlates an outstanding create-sequence request with its outbound
/// sequence, keyed by the request's message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequenceRecord {
    pub create_sequence_message_id: String,
    pub internal_sequence_id: String,
    /// Filled in when the response arrives.
    pub sequence_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Finder for [`CreateSequenceRecord`].
#[derive(Debug, Clone, Default)]
pub struct CreateSequenceFinder {
    pub create_sequence_message_id: Option<String>,
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
}

impl Record for CreateSequenceRecord {
    const KIND: RecordKind = RecordKind::CreateSequence;
    type Finder = CreateSequenceFinder;

    fn key(&self) -> String {
        self.create_sequence_message_id.clone()
    }

    fn matches(&self, finder: &CreateSequenceFinder) -> bool {
        field_matches(&finder.create_sequence_message_id, &self.create_sequence_message_id)
            && field_matches(&finder.internal_sequence_id, &self.internal_sequence_id)
            && optional_matches(&finder.sequence_id, &self.sequence_id)
    }
}
