//! Outbound transmission and retransmission.
//!
//! # Overview
//!
//! The [`Sender`] repeatedly picks the next due [`SenderRecord`] and hands it
//! to the [`Transport`]:
//!
//! ```text
//! poll_next ── due records, oldest first
//!     │          first control message wins,
//!     │          else lowest application message number
//!     ▼
//! send_next ── ceiling reached?  ─► time out sequence, report fault
//!     │        sequence finished? ─► stop sending the record
//!     │        bump sent_count, reschedule (or delete if not resent)
//!     │        commit
//!     ▼
//! Transport::transmit ── error? ─► record last_send_error on the sequence
//! ```
//!
//! The transaction commits before the transport is called, so a slow
//! transport never holds record locks.
//!
//! # Backoff
//!
//! After attempt `n` the record is rescheduled `interval * 2^(n-1)` later,
//! or `interval` later with backoff disabled. A record that has been
//! transmitted [`RmPolicy::attempt_ceiling`] times is never transmitted
//! again: its sequence is marked timed out, every record of the sequence
//! stops, and [`EngineFault::RetransmissionExhausted`] goes to the
//! [`FaultHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{after, RmPolicy};
use crate::error::{EngineFault, Result, RmFault};
use crate::ranges::RangeSet;
use crate::records::{MessageKind, RmsRecord, SenderFinder, SenderRecord};
use crate::storage::{StorageManager, Transaction};

// =============================================================================
// Collaborators
// =============================================================================

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub kind: MessageKind,
    pub destination: String,
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub message_number: Option<u64>,
    pub last_message: bool,
    pub relates_to: Option<String>,
    /// Reverse-direction sequence offered with a create-sequence request.
    pub offered_sequence_id: Option<String>,
    /// Ranges carried by acknowledgements.
    pub acknowledgement: Option<RangeSet>,
    pub fault: Option<RmFault>,
    pub payload: Option<Bytes>,
    /// 1 for the first transmission.
    pub attempt: u32,
}

/// Wire adapter the engine transmits through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

/// Receives faults produced by background work.
#[async_trait]
pub trait FaultHandler: Send + Sync {
    async fn handle_fault(&self, fault: EngineFault);
}

/// Fault handler that logs and moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFaultHandler;

#[async_trait]
impl FaultHandler for LoggingFaultHandler {
    async fn handle_fault(&self, fault: EngineFault) {
        error!(sequence_id = ?fault.sequence_id(), fault = %fault, "reliable messaging fault");
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Result of one [`Sender::send_next`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was due.
    Idle,
    Sent { message_id: String, kind: MessageKind },
    /// Handed to the transport, which failed. Retried on schedule.
    TransmitFailed { message_id: String },
    /// The record hit the attempt ceiling and its sequence timed out.
    TimedOut { internal_sequence_id: String },
    /// The record was not sendable any more and was stopped or dropped.
    Skipped { message_id: String },
}

/// Transmits due outbound messages.
pub struct Sender {
    storage: Arc<dyn StorageManager>,
    transport: Arc<dyn Transport>,
    faults: Arc<dyn FaultHandler>,
    policy: RmPolicy,
    wake: Notify,
}

impl Sender {
    pub fn new(
        storage: Arc<dyn StorageManager>,
        transport: Arc<dyn Transport>,
        faults: Arc<dyn FaultHandler>,
        policy: RmPolicy,
    ) -> Self {
        Self {
            storage,
            transport,
            faults,
            policy,
            wake: Notify::new(),
        }
    }

    /// Have a running sender poll again without waiting out its interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The next record to transmit at `now`, if any.
    pub async fn poll_next(&self, tx: &mut Transaction, now: DateTime<Utc>) -> Result<Option<SenderRecord>> {
        let mut due = self.storage.senders().find(tx, &SenderFinder::due(now)).await?;
        due.sort_by(|a, b| {
            a.time_to_send
                .cmp(&b.time_to_send)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let mut lowest: Option<SenderRecord> = None;
        for record in due {
            if record.kind.is_control() {
                return Ok(Some(record));
            }
            let better = match &lowest {
                None => true,
                Some(current) => record.message_number < current.message_number,
            };
            if better {
                lowest = Some(record);
            }
        }
        Ok(lowest)
    }

    /// Transmit the next due record.
    pub async fn send_next(&self) -> Result<SendOutcome> {
        self.send_next_at(Utc::now()).await
    }

    /// Transmit the record due at `now`.
    pub async fn send_next_at(&self, now: DateTime<Utc>) -> Result<SendOutcome> {
        // Pick a candidate, then lock in sequence-first order to stage it.
        let candidate = {
            let mut tx = self.storage.begin();
            let picked = self.poll_next(&mut tx, now).await;
            tx.complete(picked)?
        };
        let Some(candidate) = candidate else {
            return Ok(SendOutcome::Idle);
        };

        let mut tx = self.storage.begin();
        let staged = self.stage(&mut tx, &candidate, now).await;
        let staged = tx.complete(staged)?;

        match staged {
            Staged::Transmit(message) => Ok(self.transmit(message).await),
            Staged::Exhausted {
                internal_sequence_id,
                fault,
            } => {
                self.faults.handle_fault(fault).await;
                Ok(SendOutcome::TimedOut {
                    internal_sequence_id,
                })
            }
            Staged::Skipped => Ok(SendOutcome::Skipped {
                message_id: candidate.message_id,
            }),
        }
    }

    /// Send until nothing is due at `now`. Returns the number of steps taken.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut steps = 0;
        while self.send_next_at(now).await? != SendOutcome::Idle {
            steps += 1;
        }
        Ok(steps)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_interval = ?self.policy.sender_poll_interval, "sender started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = self.send_next().await;
            let idle = match outcome {
                Ok(SendOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(error = %e, retryable = e.is_retryable(), "sender iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.policy.sender_poll_interval) => {}
                }
            }
        }

        info!("sender stopped");
    }

    async fn stage(&self, tx: &mut Transaction, candidate: &SenderRecord, now: DateTime<Utc>) -> Result<Staged> {
        let storage = self.storage.as_ref();

        let mut rms = match &candidate.internal_sequence_id {
            Some(id) => match storage.rms().retrieve(tx, id).await? {
                Some(rms) => Some(rms),
                None => {
                    // Sequence removed underneath the record.
                    drop_record(storage, tx, candidate).await?;
                    return Ok(Staged::Skipped);
                }
            },
            None => None,
        };
        let rmd = match (candidate.kind, &candidate.sequence_id) {
            (MessageKind::Acknowledgement, Some(id)) => storage.rmd().retrieve(tx, id).await?,
            _ => None,
        };

        let Some(mut record) = storage.senders().retrieve(tx, &candidate.message_id).await? else {
            return Ok(Staged::Skipped);
        };
        if !record.send || record.time_to_send > now {
            return Ok(Staged::Skipped);
        }

        if let Some(rms) = rms.as_mut() {
            if rms.is_finished() {
                record.send = false;
                storage.senders().update(tx, record).await?;
                return Ok(Staged::Skipped);
            }
            if record.resend && record.sent_count >= self.policy.attempt_ceiling() {
                let fault = EngineFault::RetransmissionExhausted {
                    internal_sequence_id: rms.internal_sequence_id.clone(),
                    sequence_id: rms.sequence_id.clone(),
                    message_id: record.message_id.clone(),
                    message_number: record.message_number,
                    attempts: record.sent_count,
                    last_error: rms.last_send_error.clone(),
                };
                time_out_sequence(storage, tx, rms, now).await?;
                return Ok(Staged::Exhausted {
                    internal_sequence_id: rms.internal_sequence_id.clone(),
                    fault,
                });
            }
        }

        record.sent_count += 1;
        let mut message = OutboundMessage {
            message_id: record.message_id.clone(),
            kind: record.kind,
            destination: record.destination.clone(),
            internal_sequence_id: record.internal_sequence_id.clone(),
            sequence_id: record.sequence_id.clone(),
            message_number: record.message_number,
            last_message: record.last_message,
            relates_to: record.relates_to.clone(),
            offered_sequence_id: None,
            acknowledgement: rmd.map(|r| r.completed),
            fault: record.fault.clone(),
            payload: None,
            attempt: record.sent_count,
        };
        if record.kind == MessageKind::CreateSequence {
            message.offered_sequence_id = rms.as_ref().and_then(|r| r.offered_sequence_id.clone());
        }
        if let Some(key) = &record.payload_key {
            match storage.payloads().retrieve(tx, key).await? {
                Some(payload) => message.payload = Some(payload.body),
                None => {
                    warn!(message_id = %record.message_id, payload_key = %key, "payload missing, dropping message");
                    drop_record(storage, tx, &record).await?;
                    return Ok(Staged::Skipped);
                }
            }
        }

        if record.resend {
            record.time_to_send = after(now, self.policy.retransmission_delay(record.sent_count));
            debug!(
                message_id = %record.message_id,
                kind = %record.kind,
                attempt = record.sent_count,
                next_attempt = %record.time_to_send,
                "message staged"
            );
            storage.senders().update(tx, record).await?;
        } else {
            drop_record(storage, tx, &record).await?;
        }

        Ok(Staged::Transmit(message))
    }

    async fn transmit(&self, message: OutboundMessage) -> SendOutcome {
        let message_id = message.message_id.clone();
        let kind = message.kind;
        let internal_sequence_id = message.internal_sequence_id.clone();

        match self.transport.transmit(message).await {
            Ok(()) => {
                debug!(message_id = %message_id, kind = %kind, "message transmitted");
                SendOutcome::Sent { message_id, kind }
            }
            Err(e) => {
                warn!(message_id = %message_id, kind = %kind, error = %e, "transmission failed");
                if let Some(id) = internal_sequence_id {
                    if let Err(record_err) = self.record_send_error(&id, &e).await {
                        error!(internal_sequence_id = %id, error = %record_err, "failed to record send error");
                    }
                }
                SendOutcome::TransmitFailed { message_id }
            }
        }
    }

    async fn record_send_error(&self, internal_sequence_id: &str, err: &anyhow::Error) -> Result<()> {
        let mut tx = self.storage.begin();
        let result: Result<()> = async {
            if let Some(mut rms) = self.storage.rms().retrieve(&mut tx, internal_sequence_id).await? {
                rms.last_send_error = Some(err.to_string());
                rms.last_send_error_at = Some(Utc::now());
                self.storage.rms().update(&mut tx, rms).await?;
            }
            Ok(())
        }
        .await;
        tx.complete(result)
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").field("policy", &self.policy).finish()
    }
}

enum Staged {
    Transmit(OutboundMessage),
    Exhausted {
        internal_sequence_id: String,
        fault: EngineFault,
    },
    Skipped,
}

async fn drop_record(storage: &dyn StorageManager, tx: &mut Transaction, record: &SenderRecord) -> Result<()> {
    storage.senders().delete(tx, &record.message_id).await?;
    if let Some(key) = &record.payload_key {
        storage.payloads().delete(tx, key).await?;
    }
    Ok(())
}

/// Mark `rms` timed out and stop every record of the sequence.
///
/// Writes `rms` back. The caller must hold its lock.
pub(crate) async fn time_out_sequence(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    rms: &mut RmsRecord,
    now: DateTime<Utc>,
) -> Result<usize> {
    rms.timed_out = true;
    rms.touch(now);
    storage.rms().update(tx, rms.clone()).await?;
    let stopped = stop_sequence_records(storage, tx, &rms.internal_sequence_id).await?;
    warn!(
        internal_sequence_id = %rms.internal_sequence_id,
        sequence_id = ?rms.sequence_id,
        stopped,
        "sequence timed out"
    );
    Ok(stopped)
}

/// Clear `send` on every pending record of an outbound sequence.
pub(crate) async fn stop_sequence_records(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    internal_sequence_id: &str,
) -> Result<usize> {
    let finder = SenderFinder {
        send: Some(true),
        ..SenderFinder::for_internal_sequence(internal_sequence_id)
    };
    let pending = storage.senders().find(tx, &finder).await?;
    let count = pending.len();
    for mut record in pending {
        record.send = false;
        storage.senders().update(tx, record).await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RmdRecord, SequenceState, StoredPayload};
    use crate::storage::InMemoryStorageManager;
    use crate::testing::{CollectingFaultHandler, RecordingTransport};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        storage: Arc<InMemoryStorageManager>,
        transport: Arc<RecordingTransport>,
        faults: Arc<CollectingFaultHandler>,
        sender: Sender,
    }

    fn fixture(policy: RmPolicy) -> Fixture {
        let storage = Arc::new(InMemoryStorageManager::new(Some(Duration::from_secs(1))));
        let transport = Arc::new(RecordingTransport::new());
        let faults = Arc::new(CollectingFaultHandler::new());
        let sender = Sender::new(storage.clone(), transport.clone(), faults.clone(), policy);
        Fixture {
            storage,
            transport,
            faults,
            sender,
        }
    }

    async fn established_with(storage: &InMemoryStorageManager, numbers: u64, now: DateTime<Utc>) {
        let mut tx = storage.begin();
        let mut rms = RmsRecord::new("client-1", "http://peer", now);
        rms.sequence_id = Some("s-1".into());
        rms.state = SequenceState::Established;
        for _ in 0..numbers {
            let n = rms.allocate_message_number().unwrap();
            let payload = StoredPayload::new(Bytes::from(format!("m{n}")), now);
            let record = SenderRecord::application("client-1", "s-1", "http://peer", n, payload.key.clone(), now);
            storage.senders().insert(&mut tx, record).await.unwrap();
            storage.payloads().insert(&mut tx, payload).await.unwrap();
        }
        storage.rms().insert(&mut tx, rms).await.unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_control_message_goes_first() {
        let f = fixture(RmPolicy::default());
        let now = Utc::now();
        established_with(&f.storage, 0, now).await;

        let mut tx = f.storage.begin();
        let app = SenderRecord::application("client-1", "s-1", "http://peer", 5, "p5", now - ChronoDuration::seconds(10));
        let close = SenderRecord::control(MessageKind::CloseSequence, "http://peer", now - ChronoDuration::seconds(5))
            .for_outbound("client-1");
        let close_id = close.message_id.clone();
        f.storage.senders().insert(&mut tx, app).await.unwrap();
        f.storage.senders().insert(&mut tx, close).await.unwrap();

        let next = f.sender.poll_next(&mut tx, now).await.unwrap().unwrap();
        assert_eq!(next.message_id, close_id);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_lowest_application_number_first() {
        let f = fixture(RmPolicy::default());
        let now = Utc::now();
        established_with(&f.storage, 3, now).await;

        let mut tx = f.storage.begin();
        let next = f.sender.poll_next(&mut tx, now).await.unwrap().unwrap();
        assert_eq!(next.message_number, Some(1));
        let none = f.sender.poll_next(&mut tx, now - ChronoDuration::seconds(1)).await.unwrap();
        assert!(none.is_none());
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_send_reschedules_with_backoff() {
        let policy = RmPolicy::default().with_retransmission_interval(Duration::from_millis(100));
        let f = fixture(policy.clone());
        let now = Utc::now();
        established_with(&f.storage, 1, now).await;

        let outcome = f.sender.send_next_at(now).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { kind: MessageKind::Application, .. }));
        assert_eq!(f.sender.send_next_at(now).await.unwrap(), SendOutcome::Idle);

        let mut tx = f.storage.begin();
        let record = f.storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap().remove(0);
        assert_eq!(record.sent_count, 1);
        assert_eq!(record.time_to_send, after(now, Duration::from_millis(100)));
        tx.commit().unwrap();

        let second = after(now, Duration::from_millis(100));
        f.sender.send_next_at(second).await.unwrap();
        let mut tx = f.storage.begin();
        let record = f.storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap().remove(0);
        assert_eq!(record.sent_count, 2);
        assert_eq!(record.time_to_send, after(second, Duration::from_millis(200)));
        tx.commit().unwrap();

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].attempt, 2);
        assert_eq!(sent[0].payload.as_deref(), Some(&b"m1"[..]));
    }

    #[tokio::test]
    async fn test_exhausted_sequence_times_out() {
        let policy = RmPolicy::default()
            .with_retransmission_interval(Duration::from_millis(10))
            .with_exponential_backoff(false);
        let f = fixture(policy);
        let mut now = Utc::now();
        established_with(&f.storage, 2, now).await;

        // Both messages go out 8 times each.
        for _ in 0..8 {
            assert_eq!(f.sender.drain_at(now).await.unwrap(), 2);
            now += ChronoDuration::milliseconds(10);
        }
        assert_eq!(f.transport.sent().len(), 16);

        let outcome = f.sender.send_next_at(now).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::TimedOut {
                internal_sequence_id: "client-1".into()
            }
        );
        assert_eq!(f.sender.send_next_at(now + ChronoDuration::hours(1)).await.unwrap(), SendOutcome::Idle);
        assert_eq!(f.transport.sent().len(), 16);

        let faults = f.faults.faults();
        assert_eq!(faults.len(), 1);
        assert!(matches!(
            &faults[0],
            EngineFault::RetransmissionExhausted { attempts: 8, internal_sequence_id, .. }
                if internal_sequence_id == "client-1"
        ));

        let mut tx = f.storage.begin();
        let rms = f.storage.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        assert!(rms.timed_out);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_is_recorded_and_retried() {
        let f = fixture(RmPolicy::default().with_retransmission_interval(Duration::from_millis(10)));
        let now = Utc::now();
        established_with(&f.storage, 1, now).await;
        f.transport.fail_next(1);

        let outcome = f.sender.send_next_at(now).await.unwrap();
        assert!(matches!(outcome, SendOutcome::TransmitFailed { .. }));

        let mut tx = f.storage.begin();
        let rms = f.storage.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        assert!(rms.last_send_error.is_some());
        assert!(rms.last_send_error_at.is_some());
        tx.commit().unwrap();

        let later = now + ChronoDuration::seconds(1);
        assert!(matches!(f.sender.send_next_at(later).await.unwrap(), SendOutcome::Sent { .. }));
    }

    #[tokio::test]
    async fn test_acknowledgement_carries_current_ranges_and_is_not_resent() {
        let f = fixture(RmPolicy::default());
        let now = Utc::now();

        let mut tx = f.storage.begin();
        let mut rmd = RmdRecord::new("in-1", "http://acks", true, now);
        rmd.completed = "1-3,5".parse().unwrap();
        f.storage.rmd().insert(&mut tx, rmd).await.unwrap();
        let ack = SenderRecord::control(MessageKind::Acknowledgement, "http://acks", now).on_sequence("in-1");
        f.storage.senders().insert(&mut tx, ack).await.unwrap();
        tx.commit().unwrap();

        assert!(matches!(f.sender.send_next_at(now).await.unwrap(), SendOutcome::Sent { .. }));
        let sent = f.transport.sent();
        assert_eq!(sent[0].acknowledgement.as_ref().map(|r| r.to_string()).as_deref(), Some("1-3,5"));
        assert_eq!(sent[0].destination, "http://acks");
        assert_eq!(f.sender.send_next_at(now + ChronoDuration::hours(1)).await.unwrap(), SendOutcome::Idle);
    }

    #[tokio::test]
    async fn test_finished_sequence_records_are_stopped() {
        let f = fixture(RmPolicy::default());
        let now = Utc::now();
        established_with(&f.storage, 1, now).await;

        let mut tx = f.storage.begin();
        let mut rms = f.storage.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        rms.state = SequenceState::Terminated;
        f.storage.rms().update(&mut tx, rms).await.unwrap();
        tx.commit().unwrap();

        assert!(matches!(f.sender.send_next_at(now).await.unwrap(), SendOutcome::Skipped { .. }));
        assert_eq!(f.sender.send_next_at(now).await.unwrap(), SendOutcome::Idle);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(RmPolicy::default().with_poll_interval(Duration::from_millis(5)));
        let now = Utc::now();
        established_with(&f.storage, 2, now).await;

        let sender = Arc::new(f.sender);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sender.clone().run(shutdown.clone()));

        f.transport.wait_for(2, Duration::from_secs(2)).await.unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        let numbers: Vec<_> = f.transport.sent().iter().map(|m| m.message_number).collect();
        assert_eq!(&numbers[..2], &[Some(1), Some(2)]);
    }
}
