//! Acknowledgement scheduling and processing.
//!
//! Receivers keep at most one pending acknowledgement message per sequence.
//! It is created with a delay of the acknowledgement interval so several
//! arrivals share one acknowledgement, and pulled forward to "now" for
//! duplicates and explicit requests. Its ranges are read from the receiver
//! record when it is transmitted, so it is always current.
//!
//! Senders apply inbound acknowledgements to their outbound sequence:
//! acknowledged messages stop being retransmitted and their payloads are
//! freed. A closed sequence whose messages are all acknowledged gets its
//! terminate message queued.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{after, RmPolicy};
use crate::error::{FaultCode, Result, RmFault};
use crate::ranges::RangeSet;
use crate::records::{MessageKind, RmdRecord, RmsFinder, RmsRecord, SenderFinder, SenderRecord};
use crate::storage::{StorageManager, Transaction};

/// When a scheduled acknowledgement should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckUrgency {
    /// Within the acknowledgement interval.
    Deferred,
    /// As soon as the sender runs.
    Immediate,
}

/// Make sure an acknowledgement for `rmd` is pending.
///
/// The caller must hold the lock on `rmd`.
pub async fn schedule_ack(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    rmd: &RmdRecord,
    policy: &RmPolicy,
    urgency: AckUrgency,
    now: DateTime<Utc>,
) -> Result<()> {
    let due = match urgency {
        AckUrgency::Immediate => now,
        AckUrgency::Deferred => after(now, policy.acknowledgement_interval),
    };

    let finder = SenderFinder {
        kind: Some(MessageKind::Acknowledgement),
        sequence_id: Some(rmd.sequence_id.clone()),
        send: Some(true),
        ..Default::default()
    };
    let pending = storage.senders().find(tx, &finder).await?;

    match pending.into_iter().next() {
        Some(mut ack) => {
            if ack.time_to_send > due {
                ack.time_to_send = due;
                storage.senders().update(tx, ack).await?;
            }
        }
        None => {
            let ack = SenderRecord::control(MessageKind::Acknowledgement, rmd.acks_to.clone(), due)
                .on_sequence(rmd.sequence_id.clone());
            debug!(sequence_id = %rmd.sequence_id, message_id = %ack.message_id, ?urgency, "acknowledgement scheduled");
            storage.senders().insert(tx, ack).await?;
        }
    }
    Ok(())
}

/// What applying an acknowledgement changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    pub internal_sequence_id: String,
    /// Message numbers newly acknowledged.
    pub newly_acknowledged: RangeSet,
    pub terminate_queued: bool,
}

/// Apply an acknowledgement for the outbound sequence `sequence_id`.
///
/// Fails with `UnknownSequence` if no outbound sequence has this id and with
/// `InvalidAcknowledgement` if `ranges` covers numbers never allocated. On
/// failure nothing is changed.
pub async fn apply_acknowledgement(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    sequence_id: &str,
    ranges: &RangeSet,
    now: DateTime<Utc>,
) -> Result<AckOutcome> {
    let Some(mut rms) = storage
        .rms()
        .find_unique(tx, &RmsFinder::by_sequence_id(sequence_id))
        .await?
    else {
        return Err(RmFault::unknown_sequence(sequence_id).into());
    };

    if let Some(highest) = ranges.highest() {
        if highest > rms.highest_out_message_number || ranges.lowest() == Some(0) {
            return Err(RmFault::new(
                FaultCode::InvalidAcknowledgement,
                sequence_id,
                format!(
                    "acknowledged {ranges} but only 1-{} were sent",
                    rms.highest_out_message_number
                ),
            )
            .into());
        }
    }

    let newly_acknowledged = ranges.difference(&rms.acknowledged);

    if !newly_acknowledged.is_empty() {
        let finder = SenderFinder {
            kind: Some(MessageKind::Application),
            ..SenderFinder::for_internal_sequence(rms.internal_sequence_id.clone())
        };
        for record in storage.senders().find(tx, &finder).await? {
            let acked = record.message_number.is_some_and(|n| ranges.contains(n));
            if !acked {
                continue;
            }
            storage.senders().delete(tx, &record.message_id).await?;
            if let Some(payload_key) = &record.payload_key {
                storage.payloads().delete(tx, payload_key).await?;
            }
        }
        rms.acknowledged.union(ranges);
        rms.messages_acked = rms.acknowledged.count();
        debug!(
            internal_sequence_id = %rms.internal_sequence_id,
            acknowledged = %rms.acknowledged,
            "acknowledgement applied"
        );
    }
    rms.touch(now);

    let terminate_queued = if rms.closed_by_client && rms.all_acknowledged() {
        queue_terminate(storage, tx, &mut rms, now).await?
    } else {
        false
    };

    let internal_sequence_id = rms.internal_sequence_id.clone();
    storage.rms().update(tx, rms).await?;

    Ok(AckOutcome {
        internal_sequence_id,
        newly_acknowledged,
        terminate_queued,
    })
}

/// Queue the terminate message for `rms` once. Returns whether it was queued.
///
/// The caller must hold the lock on `rms` and write it back.
pub(crate) async fn queue_terminate(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    rms: &mut RmsRecord,
    now: DateTime<Utc>,
) -> Result<bool> {
    if rms.terminate_added || rms.is_finished() {
        return Ok(false);
    }
    let Some(sequence_id) = rms.sequence_id.clone() else {
        return Ok(false);
    };

    let last = rms.highest_out_message_number;
    let mut terminate = SenderRecord::control(MessageKind::TerminateSequence, rms.destination.clone(), now)
        .for_outbound(rms.internal_sequence_id.clone())
        .on_sequence(sequence_id);
    if last > 0 {
        terminate = terminate.numbered(last);
    }
    terminate.last_message = true;
    storage.senders().insert(tx, terminate).await?;

    rms.terminate_added = true;
    rms.last_out_message_number.get_or_insert(last);
    info!(internal_sequence_id = %rms.internal_sequence_id, last_message_number = last, "terminate queued");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{SequenceState, StoredPayload};
    use crate::storage::InMemoryStorageManager;
    use bytes::Bytes;

    async fn established(storage: &InMemoryStorageManager, sent: u64) -> RmsRecord {
        let now = Utc::now();
        let mut tx = storage.begin();
        let mut rms = RmsRecord::new("client-1", "http://peer", now);
        rms.sequence_id = Some("s-1".into());
        rms.state = SequenceState::Established;
        for _ in 0..sent {
            let n = rms.allocate_message_number().unwrap();
            let payload = StoredPayload::new(Bytes::from(format!("m{n}")), now);
            let record = SenderRecord::application("client-1", "s-1", "http://peer", n, payload.key.clone(), now);
            storage.payloads().insert(&mut tx, payload).await.unwrap();
            storage.senders().insert(&mut tx, record).await.unwrap();
        }
        storage.rms().insert(&mut tx, rms.clone()).await.unwrap();
        tx.commit().unwrap();
        rms
    }

    #[tokio::test]
    async fn test_single_pending_ack_per_sequence() {
        let storage = InMemoryStorageManager::default();
        let policy = RmPolicy::default();
        let rmd = RmdRecord::new("s-1", "http://acks", true, Utc::now());
        let now = Utc::now();

        let mut tx = storage.begin();
        schedule_ack(&storage, &mut tx, &rmd, &policy, AckUrgency::Deferred, now).await.unwrap();
        schedule_ack(&storage, &mut tx, &rmd, &policy, AckUrgency::Deferred, now).await.unwrap();
        let acks = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].time_to_send, after(now, policy.acknowledgement_interval));
        assert!(!acks[0].resend);

        schedule_ack(&storage, &mut tx, &rmd, &policy, AckUrgency::Immediate, now).await.unwrap();
        let acks = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].time_to_send, now);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_ack_removes_acknowledged_messages() {
        let storage = InMemoryStorageManager::default();
        established(&storage, 4).await;

        let mut tx = storage.begin();
        let ranges: RangeSet = "1-2,4".parse().unwrap();
        let outcome = apply_acknowledgement(&storage, &mut tx, "s-1", &ranges, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.newly_acknowledged.to_string(), "1-2,4");
        assert!(!outcome.terminate_queued);

        let left = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message_number, Some(3));
        let payloads = storage.payloads().find(&mut tx, &Default::default()).await.unwrap();
        assert_eq!(payloads.len(), 1);

        let rms = storage.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        assert_eq!(rms.messages_acked, 3);
        assert_eq!(rms.unacknowledged().to_string(), "3");
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_ack_beyond_highest_sent_is_refused() {
        let storage = InMemoryStorageManager::default();
        established(&storage, 2).await;

        let mut tx = storage.begin();
        let ranges: RangeSet = "1-3".parse().unwrap();
        let err = apply_acknowledgement(&storage, &mut tx, "s-1", &ranges, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.as_fault().map(|f| f.code), Some(FaultCode::InvalidAcknowledgement));
        tx.rollback();

        let mut tx = storage.begin();
        let left = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(left.len(), 2);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let storage = InMemoryStorageManager::default();
        let mut tx = storage.begin();
        let err = apply_acknowledgement(&storage, &mut tx, "nope", &RangeSet::new(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.as_fault().map(|f| f.code), Some(FaultCode::UnknownSequence));
    }

    #[tokio::test]
    async fn test_closed_sequence_terminates_when_fully_acked() {
        let storage = InMemoryStorageManager::default();
        let mut rms = established(&storage, 2).await;

        let mut tx = storage.begin();
        rms.closed_by_client = true;
        rms.state = SequenceState::Closing;
        storage.rms().update(&mut tx, rms).await.unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin();
        let ranges: RangeSet = "1-2".parse().unwrap();
        let outcome = apply_acknowledgement(&storage, &mut tx, "s-1", &ranges, Utc::now())
            .await
            .unwrap();
        assert!(outcome.terminate_queued);

        // A repeated acknowledgement does not queue a second terminate.
        let outcome = apply_acknowledgement(&storage, &mut tx, "s-1", &ranges, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.terminate_queued);

        let left = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, MessageKind::TerminateSequence);
        assert_eq!(left[0].message_number, Some(2));
        tx.commit().unwrap();
    }
}
