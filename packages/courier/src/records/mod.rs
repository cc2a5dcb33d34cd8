//! Typed protocol records.
//!
//! Every record kind has a primary key, a finder whose `Some` fields must all
//! match exactly (`None` is a wildcard), and is stored through a
//! [`RecordStore`](crate::storage::RecordStore). Records are plain data: the
//! storage layer owns locking, and the components own the protocol logic.
//!
//! | Record | Key | Side |
//! |---|---|---|
//! | [`RmsRecord`] | internal sequence id | sender |
//! | [`RmdRecord`] | sequence id | receiver |
//! | [`SenderRecord`] | message id | both |
//! | [`InvokerRecord`] | payload key | receiver |
//! | [`SequenceProperty`] | sequence key + name | both |
//! | [`CreateSequenceRecord`] | create-sequence message id | sender |
//! | [`StoredPayload`] | payload key | both |

use std::fmt;

use serde::{Deserialize, Serialize};

mod create_seq;
mod invoker;
mod payload;
mod property;
mod rmd;
mod rms;
mod sender;

pub use create_seq::{CreateSequenceFinder, CreateSequenceRecord};
pub use invoker::{InvokerFinder, InvokerRecord};
pub use payload::{PayloadFinder, StoredPayload};
pub use property::{property_names, PropertyFinder, SequenceProperty};
pub use rmd::{RmdFinder, RmdRecord};
pub use rms::{RmsFinder, RmsRecord, MAX_MESSAGE_NUMBER};
pub use sender::{MessageKind, SenderFinder, SenderRecord};

// =============================================================================
// Sequence State
// =============================================================================

/// Lifecycle of a sequence. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    /// Create-sequence sent, no sequence id yet.
    Unestablished,
    /// Accepting new message numbers.
    Established,
    /// Closed to new messages, draining.
    Closing,
    /// Terminal.
    Terminated,
}

impl SequenceState {
    /// Staying put is allowed; going backwards is not.
    pub fn can_advance_to(self, next: SequenceState) -> bool {
        next >= self
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceState::Unestablished => "unestablished",
            SequenceState::Established => "established",
            SequenceState::Closing => "closing",
            SequenceState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Finder Helpers
// =============================================================================

/// A set finder field must equal the record's value.
pub(crate) fn field_matches<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
    match want {
        None => true,
        Some(w) => w == have,
    }
}

/// A set finder field must equal the record's value, which must be present.
pub(crate) fn optional_matches<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
    match want {
        None => true,
        Some(w) => have.as_ref() == Some(w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_only_move_forward() {
        use SequenceState::*;
        assert!(Unestablished.can_advance_to(Established));
        assert!(Established.can_advance_to(Terminated));
        assert!(Closing.can_advance_to(Closing));
        assert!(!Closing.can_advance_to(Established));
        assert!(!Terminated.can_advance_to(Unestablished));
    }

    #[test]
    fn test_finder_helpers() {
        assert!(field_matches(&None, &3));
        assert!(field_matches(&Some(3), &3));
        assert!(!field_matches(&Some(4), &3));
        assert!(optional_matches::<u8>(&None, &None));
        assert!(!optional_matches(&Some(1), &None));
        assert!(optional_matches(&Some(1), &Some(1)));
    }
}
