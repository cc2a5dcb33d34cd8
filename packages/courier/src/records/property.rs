use serde::{Deserialize, Serialize};

use super::field_matches;
use crate::storage::{Record, RecordKind};

/// Well-known property names.
pub mod property_names {
    pub const RM_VERSION: &str = "rm_version";
    pub const ADDRESSING_VERSION: &str = "addressing_version";
    pub const SECURITY_TOKEN: &str = "security_token";
}

/// A named value attached to a sequence.
///
/// The sequence key is the sequence id on the receiving side and the internal
/// sequence id on the sending side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceProperty {
    pub sequence_key: String,
    pub name: String,
    pub value: String,
}

impl SequenceProperty {
    pub fn new(sequence_key: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            sequence_key: sequence_key.into(),
            name: name.into(),
            value: value.into(),
        }
    }

    /// Primary key for a (sequence, name) pair.
    pub fn key_for(sequence_key: &str, name: &str) -> String {
        format!("{sequence_key}\u{1f}{name}")
    }
}

/// Finder for [`SequenceProperty`].
#[derive(Debug, Clone, Default)]
pub struct PropertyFinder {
    pub sequence_key: Option<String>,
    pub name: Option<String>,
}

impl Record for SequenceProperty {
    const KIND: RecordKind = RecordKind::Property;
    type Finder = PropertyFinder;

    fn key(&self) -> String {
        Self::key_for(&self.sequence_key, &self.name)
    }

    fn matches(&self, finder: &PropertyFinder) -> bool {
        field_matches(&finder.sequence_key, &self.sequence_key) && field_matches(&finder.name, &self.name)
    }
}
