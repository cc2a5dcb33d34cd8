//! Inbound acceptance and ordered, exactly-once delivery.
//!
//! # Overview
//!
//! Inbound application messages pass through two steps, each in its own
//! transaction:
//!
//! ```text
//! accept ──► validate ──► duplicate? ──► immediate ack, done
//!                │
//!                ├─► stale (skipped by a forced delivery)? ──► ack, drop
//!                │
//!                └─► store payload + invoker record, mark completed,
//!                    schedule ack
//!
//! invoke_ready ──► lowest deliverable pending record
//!                   └─► Application::invoke ──► Ok:  mark invoked, free payload
//!                                           └─► Err: roll back, retry next pass
//! ```
//!
//! The receiver record lock is held for the whole delivery, so messages of
//! one sequence are never handed to the application concurrently, and
//! `invoked` is only written after the application succeeded.
//!
//! # Ordering
//!
//! In-order sequences only deliver `next_message_number_to_process`, or a
//! number a forced delivery left in the late-delivery window. Other
//! sequences deliver the lowest pending number at once.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acks::{schedule_ack, AckUrgency};
use crate::config::RmPolicy;
use crate::error::{InternalFault, Result, RmFault};
use crate::records::{InvokerFinder, InvokerRecord, RmdFinder, RmdRecord, StoredPayload};
use crate::storage::{StorageManager, Transaction};
use crate::validator::{validate_application_message, validate_versions, ProtocolVersions};

/// The application messages are delivered to.
#[async_trait]
pub trait Application: Send + Sync {
    /// Handle one message. An error leaves it pending for the next pass.
    async fn invoke(&self, payload: Bytes, sequence_id: &str, message_number: u64) -> anyhow::Result<()>;
}

/// An application message received by the binding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sequence_id: String,
    pub message_number: u64,
    pub message_id: Option<String>,
    pub payload: Bytes,
    /// The peer marked this as the last message of the sequence.
    pub last_message: bool,
    pub versions: ProtocolVersions,
}

impl InboundMessage {
    pub fn new(sequence_id: impl Into<String>, message_number: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            message_number,
            message_id: None,
            payload: payload.into(),
            last_message: false,
            versions: ProtocolVersions::default(),
        }
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptOutcome {
    /// Stored for delivery.
    Accepted,
    /// Already received. Acknowledged again, not stored.
    Duplicate,
    /// Arrived after a forced delivery skipped it. Acknowledged, never delivered.
    Dropped,
}

enum Step {
    Idle,
    Delivered(u64),
    Failed(u64),
}

/// Accepts inbound messages and delivers them to the [`Application`].
pub struct Invoker {
    storage: Arc<dyn StorageManager>,
    application: Arc<dyn Application>,
    policy: RmPolicy,
    wake: Notify,
}

impl Invoker {
    pub fn new(storage: Arc<dyn StorageManager>, application: Arc<dyn Application>, policy: RmPolicy) -> Self {
        Self {
            storage,
            application,
            policy,
            wake: Notify::new(),
        }
    }

    /// Validate and store an inbound message.
    pub async fn accept(&self, message: InboundMessage) -> Result<AcceptOutcome> {
        self.accept_at(message, Utc::now()).await
    }

    pub async fn accept_at(&self, message: InboundMessage, now: DateTime<Utc>) -> Result<AcceptOutcome> {
        let mut tx = self.storage.begin();
        let result = self.accept_in(&mut tx, message, now).await;
        let outcome = tx.complete(result)?;
        if outcome == AcceptOutcome::Accepted {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    async fn accept_in(&self, tx: &mut Transaction, message: InboundMessage, now: DateTime<Utc>) -> Result<AcceptOutcome> {
        let storage = self.storage.as_ref();
        let sequence_id = message.sequence_id.as_str();
        let n = message.message_number;

        let rmd = storage.rmd().retrieve(tx, sequence_id).await?;
        let mut rmd = validate_application_message(sequence_id, rmd, n)?;
        validate_versions(storage, tx, sequence_id, &message.versions).await?;

        if rmd.is_duplicate(n) {
            debug!(sequence_id, message_number = n, "duplicate message");
            rmd.touch(now);
            schedule_ack(storage, tx, &rmd, &self.policy, AckUrgency::Immediate, now).await?;
            storage.rmd().update(tx, rmd).await?;
            return Ok(AcceptOutcome::Duplicate);
        }

        if message.last_message {
            rmd.declare_last_message(n);
        }
        rmd.record_arrival(n, message.message_id.as_deref(), now);

        if rmd.is_stale(n) {
            info!(sequence_id, message_number = n, "message arrived after it was skipped, dropping");
            schedule_ack(storage, tx, &rmd, &self.policy, AckUrgency::Deferred, now).await?;
            storage.rmd().update(tx, rmd).await?;
            return Ok(AcceptOutcome::Dropped);
        }

        schedule_ack(storage, tx, &rmd, &self.policy, AckUrgency::Deferred, now).await?;

        let payload = StoredPayload::new(message.payload, now);
        let mut record = InvokerRecord::new(payload.key.clone(), sequence_id, n, now);
        record.message_id = message.message_id;
        storage.invokers().insert(tx, record).await?;
        storage.payloads().insert(tx, payload).await?;
        storage.rmd().update(tx, rmd).await?;

        debug!(sequence_id, message_number = n, "message accepted");
        Ok(AcceptOutcome::Accepted)
    }

    /// Deliver every message of `sequence_id` that may be delivered now.
    ///
    /// Returns how many were delivered. Stops at the first application
    /// failure, leaving that message pending.
    pub async fn invoke_ready(&self, sequence_id: &str) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let mut tx = self.storage.begin();
            let step = self.deliver_next(&mut tx, sequence_id, None).await;
            match tx.complete(step)? {
                Step::Idle => return Ok(delivered),
                Step::Delivered(_) => delivered += 1,
                Step::Failed(n) => {
                    debug!(sequence_id, message_number = n, delivered, "delivery paused at failed message");
                    return Ok(delivered);
                }
            }
        }
    }

    /// Run [`invoke_ready`](Self::invoke_ready) for every receiver sequence.
    pub async fn invoke_all(&self) -> Result<usize> {
        let sequence_ids: Vec<String> = {
            let mut tx = self.storage.begin();
            let found = self.storage.rmd().find(&mut tx, &RmdFinder::default()).await;
            tx.complete(found)?.into_iter().map(|r| r.sequence_id).collect()
        };

        let mut delivered = 0;
        for sequence_id in sequence_ids {
            delivered += self.invoke_ready(&sequence_id).await?;
        }
        Ok(delivered)
    }

    /// Deliver every pending message of `sequence_id` now, ignoring gaps.
    ///
    /// The delivery cursor moves past the highest delivered number. With
    /// `allow_late`, numbers skipped this way are still delivered if they
    /// arrive later; without it they are dropped on arrival.
    pub async fn force_invoke(&self, sequence_id: &str, allow_late: bool) -> Result<usize> {
        let mut delivered = 0;
        let mut highest = None;
        let mut failed_at = None;
        loop {
            let mut tx = self.storage.begin();
            let step = self.deliver_next(&mut tx, sequence_id, Some(allow_late)).await;
            match tx.complete(step)? {
                Step::Idle => break,
                Step::Delivered(n) => {
                    delivered += 1;
                    highest = Some(n);
                }
                Step::Failed(n) => {
                    failed_at = Some(n);
                    break;
                }
            }
        }
        info!(sequence_id, delivered, allow_late, ?highest, ?failed_at, "forced delivery finished");
        Ok(delivered)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_interval = ?self.policy.invoker_poll_interval, "invoker started");

        loop {
            if let Err(e) = self.invoke_all().await {
                error!(error = %e, retryable = e.is_retryable(), "invoker iteration failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.policy.invoker_poll_interval) => {}
            }
        }

        info!("invoker stopped");
    }

    /// Deliver one message. `force` is `Some(allow_late)` for forced delivery.
    async fn deliver_next(&self, tx: &mut Transaction, sequence_id: &str, force: Option<bool>) -> Result<Step> {
        let storage = self.storage.as_ref();

        let Some(mut rmd) = storage.rmd().retrieve(tx, sequence_id).await? else {
            if force.is_some() {
                return Err(RmFault::unknown_sequence(sequence_id).into());
            }
            return Ok(Step::Idle);
        };

        let mut pending = storage.invokers().find(tx, &InvokerFinder::pending(sequence_id)).await?;
        pending.sort_by_key(|r| r.message_number);
        let next = match force {
            Some(_) => pending.into_iter().next(),
            None => pending.into_iter().find(|r| rmd.is_deliverable(r.message_number)),
        };
        let Some(mut record) = next else {
            return Ok(Step::Idle);
        };
        let n = record.message_number;

        let Some(payload) = storage.payloads().retrieve(tx, &record.payload_key).await? else {
            return Err(InternalFault::Inconsistent(format!(
                "payload {} of message {n} on {sequence_id} is missing",
                record.payload_key
            ))
            .into());
        };

        if let Err(e) = self.application.invoke(payload.body, sequence_id, n).await {
            warn!(sequence_id, message_number = n, error = %e, "application failed, will retry");
            return Ok(Step::Failed(n));
        }

        record.invoked = true;
        storage.invokers().update(tx, record).await?;
        storage.payloads().delete(tx, &payload.key).await?;
        match force {
            Some(allow_late) => skip_to(&mut rmd, n, allow_late),
            None => rmd.record_delivery(n),
        }
        storage.rmd().update(tx, rmd).await?;

        debug!(sequence_id, message_number = n, "message delivered");
        Ok(Step::Delivered(n))
    }
}

/// Move the cursor of `rmd` past a force-delivered `n`.
fn skip_to(rmd: &mut RmdRecord, n: u64, allow_late: bool) {
    if !rmd.in_order || n < rmd.next_message_number_to_process {
        rmd.record_delivery(n);
        return;
    }
    if allow_late {
        for gap in rmd.completed.gaps(rmd.next_message_number_to_process, n) {
            rmd.late_delivery.insert_range(gap);
        }
    }
    rmd.next_message_number_to_process = n + 1;
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").field("policy", &self.policy).finish()
    }
}
