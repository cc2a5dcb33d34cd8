//! Error types for courier.
//!
//! Errors are split by who has to react to them:
//!
//! - [`RmFault`] is a protocol fault. It is reported to the peer and carries a
//!   [`FaultCode`] the binding layer can put on the wire.
//! - [`StorageError`] comes from the persistence layer. Only
//!   [`StorageError::LockTimeout`] is worth retrying.
//! - [`InternalFault`] means this endpoint refused or could not process a
//!   message for local reasons (version mismatch, corrupt records).
//! - [`EngineFault`] is what background work hands to a
//!   [`FaultHandler`](crate::FaultHandler). It is never returned to a caller.
//!
//! [`CourierError`] aggregates them for the public operations.
//!
//! # The Rollback Rule
//!
//! Every public operation runs in one transaction. Whenever an operation
//! returns `Err`, its transaction has been rolled back and nothing it touched
//! is persisted.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::records::SequenceState;
use crate::storage::{LockKey, RecordKind};

// =============================================================================
// Protocol Faults
// =============================================================================

/// Protocol-level fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    /// The sequence id is not known to this endpoint.
    UnknownSequence,
    /// The message number would exceed the largest allowed number.
    MessageNumberRollover,
    /// An acknowledgement covered numbers that were never sent.
    InvalidAcknowledgement,
    /// The receiver declined to create a sequence.
    CreateSequenceRefused,
    /// A message number above the declared last message number arrived.
    LastMessageNumberExceeded,
    /// The sequence has been terminated.
    SequenceTerminated,
    /// The sequence is closed to new messages.
    SequenceClosed,
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCode::UnknownSequence => "UnknownSequence",
            FaultCode::MessageNumberRollover => "MessageNumberRollover",
            FaultCode::InvalidAcknowledgement => "InvalidAcknowledgement",
            FaultCode::CreateSequenceRefused => "CreateSequenceRefused",
            FaultCode::LastMessageNumberExceeded => "LastMessageNumberExceeded",
            FaultCode::SequenceTerminated => "SequenceTerminated",
            FaultCode::SequenceClosed => "SequenceClosed",
        };
        f.write_str(name)
    }
}

/// A protocol fault raised against a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code} on sequence {sequence_id}: {detail}")]
pub struct RmFault {
    pub code: FaultCode,
    pub sequence_id: String,
    pub detail: String,
}

impl RmFault {
    pub fn new(code: FaultCode, sequence_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            sequence_id: sequence_id.into(),
            detail: detail.into(),
        }
    }

    pub fn unknown_sequence(sequence_id: impl Into<String>) -> Self {
        Self::new(
            FaultCode::UnknownSequence,
            sequence_id,
            "the sequence is not known to this endpoint",
        )
    }

    pub fn terminated(sequence_id: impl Into<String>) -> Self {
        Self::new(
            FaultCode::SequenceTerminated,
            sequence_id,
            "the sequence has been terminated",
        )
    }
}

// =============================================================================
// Internal Faults
// =============================================================================

/// Local processing failures that are not protocol faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalFault {
    /// An inbound message declared a different version than the one recorded
    /// for its sequence.
    #[error("{property} mismatch on {sequence_key}: recorded {expected:?}, received {actual:?}")]
    VersionMismatch {
        sequence_key: String,
        property: String,
        expected: String,
        actual: String,
    },

    /// Message numbers start at 1.
    #[error("invalid message number {0}")]
    InvalidMessageNumber(u64),

    /// A sequence was asked to move backwards through its lifecycle.
    #[error("sequence {sequence} cannot move from {from} to {to}")]
    IllegalTransition {
        sequence: String,
        from: SequenceState,
        to: SequenceState,
    },

    /// Records disagree with each other.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Errors from a [`StorageManager`](crate::StorageManager) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} record {key:?} already exists")]
    DuplicateKey { kind: RecordKind, key: String },

    #[error("{kind} record {key:?} does not exist")]
    NotFound { kind: RecordKind, key: String },

    #[error("{count} {kind} records matched a unique finder")]
    NonUniqueResult { kind: RecordKind, count: usize },

    /// Waiting for another transaction to release a record took too long.
    ///
    /// The caller may retry the whole operation.
    #[error("timed out after {waited:?} waiting for {lock}")]
    LockTimeout { lock: LockKey, waited: Duration },

    #[error("transaction {0} has already finished")]
    TransactionFinished(Uuid),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    /// Storage backend failed (connection, disk, etc).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether retrying the operation from scratch can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}

// =============================================================================
// Courier Error
// =============================================================================

/// Errors returned by the public courier operations.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fault(#[from] RmFault),

    #[error(transparent)]
    Internal(#[from] InternalFault),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No outbound sequence exists under this internal id.
    #[error("no outbound sequence {0:?}")]
    UnknownInternalSequence(String),

    /// Application messages can only be sent on established sequences.
    #[error("sequence {internal_sequence_id:?} is {state}, not established")]
    NotEstablished {
        internal_sequence_id: String,
        state: SequenceState,
    },

    /// The sequence still has messages that are neither acknowledged nor
    /// exhausted.
    #[error("sequence {internal_sequence_id:?} still has {pending} unacknowledged messages")]
    PendingMessages {
        internal_sequence_id: String,
        pending: u64,
    },
}

impl CourierError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CourierError::Storage(e) if e.is_retryable())
    }

    /// The protocol fault, if this error is one.
    pub fn as_fault(&self) -> Option<&RmFault> {
        match self {
            CourierError::Fault(f) => Some(f),
            _ => None,
        }
    }
}

/// Result alias for courier operations.
pub type Result<T, E = CourierError> = std::result::Result<T, E>;

// =============================================================================
// Engine Faults
// =============================================================================

/// Faults produced by background work, delivered to the fault handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub enum EngineFault {
    /// A fault received from, or raised against, the peer.
    #[error("protocol fault: {0}")]
    Protocol(RmFault),

    /// A message hit the retransmission ceiling. Its sequence is timed out.
    #[error("message {message_id} on {internal_sequence_id} was not acknowledged after {attempts} attempts")]
    RetransmissionExhausted {
        internal_sequence_id: String,
        sequence_id: Option<String>,
        message_id: String,
        message_number: Option<u64>,
        attempts: u32,
        last_error: Option<String>,
    },

    /// An outbound sequence saw no activity for longer than the inactivity
    /// timeout.
    #[error("sequence {internal_sequence_id} was inactive for {idle_ms}ms")]
    InactivityTimeout {
        internal_sequence_id: String,
        sequence_id: Option<String>,
        idle_ms: u64,
    },
}

impl EngineFault {
    /// The sequence the fault concerns, if known.
    pub fn sequence_id(&self) -> Option<&str> {
        match self {
            EngineFault::Protocol(f) => Some(&f.sequence_id),
            EngineFault::RetransmissionExhausted { sequence_id, .. }
            | EngineFault::InactivityTimeout { sequence_id, .. } => sequence_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lock_timeout_is_retryable() {
        let timeout = StorageError::LockTimeout {
            lock: LockKey::new(RecordKind::Rms, "a"),
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_retryable());
        assert!(CourierError::from(timeout).is_retryable());

        let dup = StorageError::DuplicateKey {
            kind: RecordKind::Rms,
            key: "a".into(),
        };
        assert!(!dup.is_retryable());
        assert!(!CourierError::from(RmFault::unknown_sequence("s")).is_retryable());
    }

    #[test]
    fn test_fault_display_names_code_and_sequence() {
        let fault = RmFault::unknown_sequence("urn:uuid:1");
        let text = fault.to_string();
        assert!(text.starts_with("UnknownSequence on sequence urn:uuid:1"));
        assert_eq!(
            CourierError::from(fault.clone()).as_fault(),
            Some(&fault)
        );
    }
}
