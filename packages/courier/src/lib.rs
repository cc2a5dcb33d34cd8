//! # Courier
//!
//! A transactional reliable-messaging engine. Outbound messages travel on
//! numbered sequences and are retransmitted until the peer acknowledges them.
//! Inbound messages are delivered to the application exactly once, in order
//! when the sequence asks for it.
//!
//! ## Core Concepts
//!
//! Every sequence has two ends:
//! - an **RMS** record ([`RmsRecord`]) on the sending side, keyed by the
//!   caller's internal sequence id
//! - an **RMD** record ([`RmdRecord`]) on the receiving side, keyed by the
//!   wire sequence id
//!
//! Work is queued as records, never held in memory:
//! - [`SenderRecord`] = a message waiting to go out (or to go out again)
//! - [`InvokerRecord`] = a received message waiting for the application
//!
//! The key principle: **state changes happen inside one storage transaction,
//! and IO happens after it commits.** A transport or application failure
//! never leaves a half-written sequence behind.
//!
//! ## Architecture
//!
//! ```text
//! Caller                       Peer
//!   │ send()                     ▲
//!   ▼                            │ Transport.transmit()
//! Engine ──► SenderRecord ──► Sender loop
//!   ▲                            │
//!   │ handle_inbound_*()         └─► backoff, exhaustion, timed out
//!   │
//!   ├─► ControlHandler ──► acks, create/close/terminate
//!   │
//!   └─► InvokerRecord ──► Invoker loop ──► Application.invoke()
//!
//! Housekeeper loop: inactivity timeouts, removal of finished sequences
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Numbers are gap-free** - an outbound sequence hands out 1, 2, 3, ...
//! 2. **Exactly once** - a message number is invoked at most once per sequence
//! 3. **In order when asked** - no number is invoked before its predecessor
//! 4. **Locks in one order** - CreateSequence, RMS, RMD, Property, Sender,
//!    Invoker, Payload
//!
//! ## Example
//!
//! ```ignore
//! use courier::{EngineBuilder, InMemoryStorageManager, SequenceOptions};
//!
//! let engine = EngineBuilder::new(Arc::new(InMemoryStorageManager::default()))
//!     .with_transport(my_transport)
//!     .with_application(my_application)
//!     .build()?;
//! let handle = engine.start();
//!
//! engine.create_sequence("orders", SequenceOptions::new("http://peer/rm")).await?;
//! // ... the peer answers with a CreateSequenceResponse ...
//! engine.send("orders", Bytes::from_static(b"<order/>")).await?;
//!
//! handle.shutdown().await;
//! ```

// Core modules
mod acks;
mod config;
mod control;
mod engine;
mod error;
mod housekeeping;
mod invoker;
mod ranges;
mod report;
mod sender;
mod validator;

// Persistent state
pub mod records;
pub mod storage;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export range types
pub use ranges::{Range, RangeParseError, RangeSet};

// Re-export error types
pub use crate::error::{
    CourierError, EngineFault, FaultCode, InternalFault, Result, RmFault, StorageError,
};

// Re-export configuration
pub use config::{ConfigError, RmPolicy, MAX_RETRANSMISSION_CEILING};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, EngineHandle, SequenceCompletion, SequenceOptions};

// Re-export component types
pub use acks::{apply_acknowledgement, schedule_ack, AckOutcome, AckUrgency};
pub use control::{ControlHandler, ControlMessage, ControlOutcome, SequenceOffer};
pub use housekeeping::{Housekeeper, HousekeepingReport};
pub use invoker::{AcceptOutcome, Application, InboundMessage, Invoker};
pub use report::{
    endpoint_report, sequence_report, EndpointReport, InboundReport, OutboundReport, SequenceReport,
};
pub use sender::{FaultHandler, LoggingFaultHandler, OutboundMessage, SendOutcome, Sender, Transport};
pub use validator::{validate_application_message, validate_versions, ProtocolVersions};

// Re-export record and storage types
pub use records::{
    InvokerRecord, MessageKind, RmdRecord, RmsRecord, SenderRecord, SequenceState,
};
pub use storage::{InMemoryStorageManager, RecordStore, StorageManager, Transaction};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use bytes::Bytes;
