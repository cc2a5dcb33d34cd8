//! Read-only views of sequence state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::ranges::RangeSet;
use crate::records::{InvokerFinder, RmdFinder, RmdRecord, RmsFinder, RmsRecord, SequenceState};
use crate::storage::{StorageManager, Transaction};

/// State of one sequence, as seen from this endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum SequenceReport {
    Outbound(OutboundReport),
    Inbound(InboundReport),
}

impl SequenceReport {
    pub fn state(&self) -> SequenceState {
        match self {
            SequenceReport::Outbound(r) => r.state,
            SequenceReport::Inbound(r) => r.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundReport {
    pub internal_sequence_id: String,
    pub sequence_id: Option<String>,
    pub state: SequenceState,
    pub timed_out: bool,
    pub closed_by_client: bool,
    pub acknowledged: RangeSet,
    /// Allocated numbers not yet acknowledged.
    pub unacknowledged: RangeSet,
    pub highest_message_number: u64,
    pub last_send_error: Option<String>,
    pub last_send_error_at: Option<DateTime<Utc>>,
    pub last_activated: DateTime<Utc>,
}

impl From<RmsRecord> for OutboundReport {
    fn from(rms: RmsRecord) -> Self {
        Self {
            unacknowledged: rms.unacknowledged(),
            internal_sequence_id: rms.internal_sequence_id,
            sequence_id: rms.sequence_id,
            state: rms.state,
            timed_out: rms.timed_out,
            closed_by_client: rms.closed_by_client,
            acknowledged: rms.acknowledged,
            highest_message_number: rms.highest_out_message_number,
            last_send_error: rms.last_send_error,
            last_send_error_at: rms.last_send_error_at,
            last_activated: rms.last_activated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundReport {
    pub sequence_id: String,
    pub state: SequenceState,
    pub in_order: bool,
    /// Every number received so far.
    pub completed: RangeSet,
    pub next_message_number_to_process: u64,
    /// Received numbers still waiting for delivery.
    pub pending: Vec<u64>,
    pub last_message_number: Option<u64>,
    pub last_activated: DateTime<Utc>,
}

impl InboundReport {
    fn new(rmd: RmdRecord, pending: Vec<u64>) -> Self {
        Self {
            sequence_id: rmd.sequence_id,
            state: rmd.state,
            in_order: rmd.in_order,
            completed: rmd.completed,
            next_message_number_to_process: rmd.next_message_number_to_process,
            pending,
            last_message_number: rmd.last_message_number,
            last_activated: rmd.last_activated,
        }
    }
}

/// Every sequence this endpoint knows, in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointReport {
    pub outbound: Vec<OutboundReport>,
    pub inbound: Vec<InboundReport>,
}

impl EndpointReport {
    /// Messages received or acknowledged on the sequence with wire id `sequence_id`.
    pub fn completed_messages(&self, sequence_id: &str) -> Option<u64> {
        let outbound = self
            .outbound
            .iter()
            .find(|r| r.sequence_id.as_deref() == Some(sequence_id))
            .map(|r| r.acknowledged.count());
        outbound.or_else(|| {
            self.inbound
                .iter()
                .find(|r| r.sequence_id == sequence_id)
                .map(|r| r.completed.count())
        })
    }
}

/// Report on every outbound and inbound sequence.
pub async fn endpoint_report(storage: &dyn StorageManager, tx: &mut Transaction) -> Result<EndpointReport> {
    let outbound = storage
        .rms()
        .find(tx, &RmsFinder::default())
        .await?
        .into_iter()
        .map(OutboundReport::from)
        .collect();

    let mut inbound = Vec::new();
    for rmd in storage.rmd().find(tx, &RmdFinder::default()).await? {
        let pending = pending_numbers(storage, tx, &rmd.sequence_id).await?;
        inbound.push(InboundReport::new(rmd, pending));
    }
    Ok(EndpointReport { outbound, inbound })
}

async fn pending_numbers(storage: &dyn StorageManager, tx: &mut Transaction, sequence_id: &str) -> Result<Vec<u64>> {
    let mut pending: Vec<u64> = storage
        .invokers()
        .find(tx, &InvokerFinder::pending(sequence_id))
        .await?
        .into_iter()
        .map(|r| r.message_number)
        .collect();
    pending.sort_unstable();
    Ok(pending)
}

/// Report on the sequence known as `id`.
///
/// `id` is tried as an internal sequence id, then as the wire id of an
/// outbound sequence, then as an inbound sequence id.
pub async fn sequence_report(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    id: &str,
) -> Result<Option<SequenceReport>> {
    if let Some(rms) = storage.rms().retrieve(tx, id).await? {
        return Ok(Some(SequenceReport::Outbound(rms.into())));
    }
    if let Some(rms) = storage.rms().find_unique(tx, &RmsFinder::by_sequence_id(id)).await? {
        return Ok(Some(SequenceReport::Outbound(rms.into())));
    }

    let Some(rmd) = storage.rmd().retrieve(tx, id).await? else {
        return Ok(None);
    };
    let pending = pending_numbers(storage, tx, id).await?;
    Ok(Some(SequenceReport::Inbound(InboundReport::new(rmd, pending))))
}
