use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{field_matches, optional_matches};
use crate::error::RmFault;
use crate::storage::{Record, RecordKind};

/// What an outbound message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Application,
    CreateSequence,
    CreateSequenceResponse,
    Acknowledgement,
    AckRequested,
    CloseSequence,
    CloseSequenceResponse,
    TerminateSequence,
    TerminateSequenceResponse,
    Fault,
}

impl MessageKind {
    /// Protocol control messages jump the application queue.
    pub fn is_control(self) -> bool {
        self != MessageKind::Application
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Application => "application",
            MessageKind::CreateSequence => "create_sequence",
            MessageKind::CreateSequenceResponse => "create_sequence_response",
            MessageKind::Acknowledgement => "acknowledgement",
            MessageKind::AckRequested => "ack_requested",
            MessageKind::CloseSequence => "close_sequence",
            MessageKind::CloseSequenceResponse => "close_sequence_response",
            MessageKind::TerminateSequence => "terminate_sequence",
            MessageKind::TerminateSequenceResponse => "terminate_sequence_response",
            MessageKind::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// An outbound message waiting to be (re)transmitted, keyed by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderRecord {
    pub message_id: String,
    pub kind: MessageKind,
    /// Key of the stored payload, for application messages.
    pub payload_key: Option<String>,
    /// Cleared to stop transmission without deleting the record.
    pub send: bool,
    /// Owning outbound sequence. Receiver-side messages have none.
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub destination: String,
    pub message_number: Option<u64>,
    pub last_message: bool,
    /// Whether the message is retransmitted until acknowledged.
    pub resend: bool,
    pub sent_count: u32,
    pub time_to_send: DateTime<Utc>,
    /// Message this one answers, for responses and faults.
    pub relates_to: Option<String>,
    pub fault: Option<RmFault>,
}

impl SenderRecord {
    /// A protocol message due at `time_to_send`.
    pub fn control(kind: MessageKind, destination: impl Into<String>, time_to_send: DateTime<Utc>) -> Self {
        Self {
            message_id: format!("urn:uuid:{}", Uuid::new_v4()),
            kind,
            payload_key: None,
            send: true,
            internal_sequence_id: None,
            sequence_id: None,
            destination: destination.into(),
            message_number: None,
            last_message: false,
            resend: matches!(
                kind,
                MessageKind::CreateSequence
                    | MessageKind::CloseSequence
                    | MessageKind::TerminateSequence
            ),
            sent_count: 0,
            time_to_send,
            relates_to: None,
            fault: None,
        }
    }

    /// An application message carrying `message_number`.
    pub fn application(
        internal_sequence_id: impl Into<String>,
        sequence_id: impl Into<String>,
        destination: impl Into<String>,
        message_number: u64,
        payload_key: impl Into<String>,
        time_to_send: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: format!("urn:uuid:{}", Uuid::new_v4()),
            kind: MessageKind::Application,
            payload_key: Some(payload_key.into()),
            send: true,
            internal_sequence_id: Some(internal_sequence_id.into()),
            sequence_id: Some(sequence_id.into()),
            destination: destination.into(),
            message_number: Some(message_number),
            last_message: false,
            resend: true,
            sent_count: 0,
            time_to_send,
            relates_to: None,
            fault: None,
        }
    }

    pub fn for_outbound(mut self, internal_sequence_id: impl Into<String>) -> Self {
        self.internal_sequence_id = Some(internal_sequence_id.into());
        self
    }

    pub fn on_sequence(mut self, sequence_id: impl Into<String>) -> Self {
        self.sequence_id = Some(sequence_id.into());
        self
    }

    pub fn numbered(mut self, message_number: u64) -> Self {
        self.message_number = Some(message_number);
        self
    }

    pub fn relating_to(mut self, message_id: impl Into<String>) -> Self {
        self.relates_to = Some(message_id.into());
        self
    }

    pub fn with_fault(mut self, fault: RmFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

/// Finder for [`SenderRecord`].
///
/// `due_by` matches records whose `time_to_send` is at or before it.
#[derive(Debug, Clone, Default)]
pub struct SenderFinder {
    pub message_id: Option<String>,
    pub kind: Option<MessageKind>,
    pub send: Option<bool>,
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub message_number: Option<u64>,
    pub due_by: Option<DateTime<Utc>>,
}

impl SenderFinder {
    pub fn for_internal_sequence(internal_sequence_id: impl Into<String>) -> Self {
        Self {
            internal_sequence_id: Some(internal_sequence_id.into()),
            ..Default::default()
        }
    }

    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            send: Some(true),
            due_by: Some(now),
            ..Default::default()
        }
    }
}

impl Record for SenderRecord {
    const KIND: RecordKind = RecordKind::Sender;
    type Finder = SenderFinder;

    fn key(&self) -> String {
        self.message_id.clone()
    }

    fn matches(&self, finder: &SenderFinder) -> bool {
        field_matches(&finder.message_id, &self.message_id)
            && field_matches(&finder.kind, &self.kind)
            && field_matches(&finder.send, &self.send)
            && optional_matches(&finder.internal_sequence_id, &self.internal_sequence_id)
            && optional_matches(&finder.sequence_id, &self.sequence_id)
            && optional_matches(&finder.message_number, &self.message_number)
            && finder.due_by.map_or(true, |due| self.time_to_send <= due)
    }
}
