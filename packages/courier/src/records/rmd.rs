use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{field_matches, SequenceState};
use crate::error::InternalFault;
use crate::ranges::RangeSet;
use crate::storage::{Record, RecordKind};

/// Receiver-side sequence state, keyed by sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmdRecord {
    pub sequence_id: String,
    /// Where acknowledgements and responses for this sequence are sent.
    pub acks_to: String,
    pub state: SequenceState,
    pub in_order: bool,
    pub next_message_number_to_process: u64,
    pub highest_in_message_number: u64,
    pub highest_in_message_id: Option<String>,
    pub last_in_message_id: Option<String>,
    /// Every number accepted so far.
    pub completed: RangeSet,
    /// Numbers delivered ahead of `next_message_number_to_process`.
    pub out_of_order: RangeSet,
    /// Numbers skipped by a forced delivery that may still be delivered.
    pub late_delivery: RangeSet,
    /// Declared by the peer on close or terminate.
    pub last_message_number: Option<u64>,
    pub reference_message_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activated: DateTime<Utc>,
}

impl RmdRecord {
    pub fn new(
        sequence_id: impl Into<String>,
        acks_to: impl Into<String>,
        in_order: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            acks_to: acks_to.into(),
            state: SequenceState::Established,
            in_order,
            next_message_number_to_process: 1,
            highest_in_message_number: 0,
            highest_in_message_id: None,
            last_in_message_id: None,
            completed: RangeSet::new(),
            out_of_order: RangeSet::new(),
            late_delivery: RangeSet::new(),
            last_message_number: None,
            reference_message_key: None,
            created_at: now,
            last_activated: now,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SequenceState::Terminated
    }

    pub fn is_duplicate(&self, n: u64) -> bool {
        self.completed.contains(n)
    }

    /// An in-order message below the delivery cursor that no forced delivery
    /// left room for. It can never be delivered.
    pub fn is_stale(&self, n: u64) -> bool {
        self.in_order && n < self.next_message_number_to_process && !self.late_delivery.contains(n)
    }

    /// Whether message `n` may be handed to the application now.
    pub fn is_deliverable(&self, n: u64) -> bool {
        if !self.in_order {
            return true;
        }
        n == self.next_message_number_to_process || self.late_delivery.contains(n)
    }

    /// Record the arrival of a new message number.
    pub fn record_arrival(&mut self, n: u64, message_id: Option<&str>, now: DateTime<Utc>) -> bool {
        let added = self.completed.insert(n);
        if n > self.highest_in_message_number {
            self.highest_in_message_number = n;
            self.highest_in_message_id = message_id.map(str::to_string);
        }
        self.last_in_message_id = message_id.map(str::to_string);
        self.last_activated = now;
        added
    }

    /// Record that `n` was handed to the application.
    pub fn record_delivery(&mut self, n: u64) {
        if self.in_order {
            if n == self.next_message_number_to_process {
                self.next_message_number_to_process += 1;
            }
            return;
        }
        self.out_of_order.insert(n);
        while self.out_of_order.contains(self.next_message_number_to_process) {
            self.next_message_number_to_process += 1;
        }
    }

    /// Set the last message number unless one is already declared.
    pub fn declare_last_message(&mut self, n: u64) {
        if self.last_message_number.is_none() {
            self.last_message_number = Some(n);
        }
    }

    /// Every message up to the declared last one has arrived.
    pub fn all_received(&self) -> bool {
        self.last_message_number
            .is_some_and(|last| self.completed.covers_up_to(last))
    }

    pub fn advance(&mut self, next: SequenceState) -> Result<(), InternalFault> {
        if !self.state.can_advance_to(next) {
            return Err(InternalFault::IllegalTransition {
                sequence: self.sequence_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activated = now;
    }
}

/// Finder for [`RmdRecord`].
#[derive(Debug, Clone, Default)]
pub struct RmdFinder {
    pub sequence_id: Option<String>,
    pub state: Option<SequenceState>,
    pub in_order: Option<bool>,
}

impl Record for RmdRecord {
    const KIND: RecordKind = RecordKind::Rmd;
    type Finder = RmdFinder;

    fn key(&self) -> String {
        self.sequence_id.clone()
    }

    fn matches(&self, finder: &RmdFinder) -> bool {
        field_matches(&finder.sequence_id, &self.sequence_id)
            && field_matches(&finder.state, &self.state)
            && field_matches(&finder.in_order, &self.in_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery_cursor() {
        let mut rmd = RmdRecord::new("s", "http://acks", true, Utc::now());
        assert!(rmd.is_deliverable(1));
        assert!(!rmd.is_deliverable(2));
        rmd.record_delivery(1);
        assert_eq!(rmd.next_message_number_to_process, 2);
        assert!(rmd.is_stale(1));
        rmd.late_delivery.insert(1);
        assert!(!rmd.is_stale(1));
        assert!(rmd.is_deliverable(1));
    }

    #[test]
    fn test_out_of_order_cursor_skips_delivered() {
        let mut rmd = RmdRecord::new("s", "http://acks", false, Utc::now());
        rmd.record_delivery(3);
        rmd.record_delivery(2);
        assert_eq!(rmd.next_message_number_to_process, 1);
        rmd.record_delivery(1);
        assert_eq!(rmd.next_message_number_to_process, 4);
        assert!(!rmd.is_stale(1));
    }

    #[test]
    fn test_arrival_bookkeeping() {
        let now = Utc::now();
        let mut rmd = RmdRecord::new("s", "http://acks", true, now);
        assert!(rmd.record_arrival(2, Some("m2"), now));
        assert!(rmd.record_arrival(1, Some("m1"), now));
        assert!(!rmd.record_arrival(2, Some("m2"), now));
        assert_eq!(rmd.highest_in_message_number, 2);
        assert_eq!(rmd.highest_in_message_id.as_deref(), Some("m2"));
        assert_eq!(rmd.last_in_message_id.as_deref(), Some("m2"));

        assert!(!rmd.all_received());
        rmd.declare_last_message(2);
        rmd.declare_last_message(9);
        assert_eq!(rmd.last_message_number, Some(2));
        assert!(rmd.all_received());
    }
}
