use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{field_matches, optional_matches, SequenceState};
use crate::error::{FaultCode, InternalFault, RmFault};
use crate::ranges::RangeSet;
use crate::storage::{Record, RecordKind};

/// Largest message number a sequence may allocate.
pub const MAX_MESSAGE_NUMBER: u64 = i64::MAX as u64;

/// Sender-side sequence state, keyed by internal sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmsRecord {
    pub internal_sequence_id: String,
    /// Assigned by the receiver when the sequence is established.
    pub sequence_id: Option<String>,
    pub destination: String,
    pub create_sequence_message_id: Option<String>,
    pub state: SequenceState,
    /// Next number to allocate. Starts at 1.
    pub next_message_number: u64,
    /// Fixed when the client closes or terminates the sequence.
    pub last_out_message_number: Option<u64>,
    /// Highest number allocated so far, 0 if none.
    pub highest_out_message_number: u64,
    pub highest_out_relates_to: Option<String>,
    pub acknowledged: RangeSet,
    pub messages_acked: u64,
    pub terminate_added: bool,
    pub timed_out: bool,
    pub closed_by_client: bool,
    pub last_send_error: Option<String>,
    pub last_send_error_at: Option<DateTime<Utc>>,
    /// Sequence id offered to the peer for the reverse direction.
    pub offered_sequence_id: Option<String>,
    pub offered_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activated: DateTime<Utc>,
}

impl RmsRecord {
    pub fn new(internal_sequence_id: impl Into<String>, destination: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            internal_sequence_id: internal_sequence_id.into(),
            sequence_id: None,
            destination: destination.into(),
            create_sequence_message_id: None,
            state: SequenceState::Unestablished,
            next_message_number: 1,
            last_out_message_number: None,
            highest_out_message_number: 0,
            highest_out_relates_to: None,
            acknowledged: RangeSet::new(),
            messages_acked: 0,
            terminate_added: false,
            timed_out: false,
            closed_by_client: false,
            last_send_error: None,
            last_send_error_at: None,
            offered_sequence_id: None,
            offered_endpoint: None,
            created_at: now,
            last_activated: now,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == SequenceState::Established
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SequenceState::Terminated
    }

    /// Terminated or timed out: nothing more will be transmitted.
    pub fn is_finished(&self) -> bool {
        self.is_terminated() || self.timed_out
    }

    /// The id used in faults and logs: the wire id once known.
    pub fn display_id(&self) -> &str {
        self.sequence_id.as_deref().unwrap_or(&self.internal_sequence_id)
    }

    /// Allocate the next message number.
    ///
    /// Numbers are strictly increasing from 1, with no gaps or reuse.
    pub fn allocate_message_number(&mut self) -> Result<u64, RmFault> {
        let n = self.next_message_number;
        if n == 0 || n > MAX_MESSAGE_NUMBER {
            return Err(RmFault::new(
                FaultCode::MessageNumberRollover,
                self.display_id(),
                format!("message number {n} exceeds {MAX_MESSAGE_NUMBER}"),
            ));
        }
        self.next_message_number = n + 1;
        self.highest_out_message_number = n;
        Ok(n)
    }

    /// Move to `next`. Moving backwards is refused.
    pub fn advance(&mut self, next: SequenceState) -> Result<(), InternalFault> {
        if !self.state.can_advance_to(next) {
            return Err(InternalFault::IllegalTransition {
                sequence: self.internal_sequence_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Allocated numbers the peer has not acknowledged.
    pub fn unacknowledged(&self) -> RangeSet {
        if self.highest_out_message_number == 0 {
            return RangeSet::new();
        }
        self.acknowledged
            .gaps(1, self.highest_out_message_number)
            .into_iter()
            .collect()
    }

    pub fn all_acknowledged(&self) -> bool {
        self.acknowledged.covers_up_to(self.highest_out_message_number)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activated = now;
    }
}

/// Finder for [`RmsRecord`].
#[derive(Debug, Clone, Default)]
pub struct RmsFinder {
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub create_sequence_message_id: Option<String>,
    pub state: Option<SequenceState>,
    pub timed_out: Option<bool>,
}

impl RmsFinder {
    pub fn by_sequence_id(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: Some(sequence_id.into()),
            ..Default::default()
        }
    }
}

impl Record for RmsRecord {
    const KIND: RecordKind = RecordKind::Rms;
    type Finder = RmsFinder;

    fn key(&self) -> String {
        self.internal_sequence_id.clone()
    }

    fn matches(&self, finder: &RmsFinder) -> bool {
        field_matches(&finder.internal_sequence_id, &self.internal_sequence_id)
            && optional_matches(&finder.sequence_id, &self.sequence_id)
            && optional_matches(
                &finder.create_sequence_message_id,
                &self.create_sequence_message_id,
            )
            && field_matches(&finder.state, &self.state)
            && field_matches(&finder.timed_out, &self.timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RmsRecord {
        RmsRecord::new("client-1", "http://peer", Utc::now())
    }

    #[test]
    fn test_allocation_is_contiguous_from_one() {
        let mut rms = record();
        let numbers: Vec<u64> = (0..5).map(|_| rms.allocate_message_number().unwrap()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(rms.highest_out_message_number, 5);
        assert_eq!(rms.next_message_number, 6);
    }

    #[test]
    fn test_allocation_refuses_rollover() {
        let mut rms = record();
        rms.next_message_number = MAX_MESSAGE_NUMBER;
        assert_eq!(rms.allocate_message_number().unwrap(), MAX_MESSAGE_NUMBER);
        let err = rms.allocate_message_number().unwrap_err();
        assert_eq!(err.code, FaultCode::MessageNumberRollover);
        assert_eq!(rms.highest_out_message_number, MAX_MESSAGE_NUMBER);
    }

    #[test]
    fn test_advance_refuses_going_back() {
        let mut rms = record();
        rms.advance(SequenceState::Established).unwrap();
        rms.advance(SequenceState::Closing).unwrap();
        assert!(rms.advance(SequenceState::Established).is_err());
        assert_eq!(rms.state, SequenceState::Closing);
    }

    #[test]
    fn test_unacknowledged() {
        let mut rms = record();
        for _ in 0..5 {
            rms.allocate_message_number().unwrap();
        }
        rms.acknowledged = "1-2,4".parse().unwrap();
        assert_eq!(rms.unacknowledged().to_string(), "3,5");
        assert_eq!(rms.unacknowledged().count(), 2);
        assert!(!rms.all_acknowledged());
        rms.acknowledged.insert_range(crate::Range::new(3, 5));
        assert!(rms.all_acknowledged());
    }

    #[test]
    fn test_unacknowledged_of_large_sequence() {
        let mut rms = record();
        rms.highest_out_message_number = 5_000_000;
        rms.acknowledged = "1-2499999,2500001-5000000".parse().unwrap();
        assert_eq!(rms.unacknowledged().to_string(), "2500000");
        rms.acknowledged = RangeSet::new();
        assert_eq!(rms.unacknowledged().count(), 5_000_000);
    }

    #[test]
    fn test_finder() {
        let mut rms = record();
        assert!(rms.matches(&RmsFinder::default()));
        assert!(!rms.matches(&RmsFinder::by_sequence_id("s-1")));
        rms.sequence_id = Some("s-1".into());
        assert!(rms.matches(&RmsFinder::by_sequence_id("s-1")));
        assert!(!rms.matches(&RmsFinder {
            timed_out: Some(true),
            ..Default::default()
        }));
    }
}
