//! Protocol control messages.
//!
//! The binding layer decodes control messages into [`ControlMessage`] and
//! hands them to [`ControlHandler::handle`]. Each message is applied in one
//! transaction. Protocol violations come back as `Err` with an
//! [`RmFault`](crate::RmFault) the binding layer can answer with.
//!
//! | Message | Side | Effect |
//! |---|---|---|
//! | `CreateSequence` | receiver | new receiver sequence, response queued |
//! | `CreateSequenceResponse` | sender | outbound sequence established |
//! | `CreateSequenceRefused` | sender | outbound sequence terminated |
//! | `Acknowledgement` | sender | acknowledged messages released |
//! | `AckRequested` | receiver | acknowledgement sent now |
//! | `CloseSequence` | receiver | closed to new numbers, response queued |
//! | `CloseSequenceResponse` | sender | terminate queued once all acked |
//! | `TerminateSequence` | receiver | terminated, response queued |
//! | `TerminateSequenceResponse` | sender | outbound records removed |
//! | `Fault` | sender | reported, sequence terminated if fatal |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acks::{apply_acknowledgement, queue_terminate, schedule_ack, AckOutcome, AckUrgency};
use crate::config::RmPolicy;
use crate::error::{EngineFault, FaultCode, InternalFault, Result, RmFault};
use crate::ranges::RangeSet;
use crate::records::{
    CreateSequenceFinder, MessageKind, RmdRecord, RmsFinder, RmsRecord, SenderFinder, SenderRecord,
    SequenceState,
};
use crate::sender::{stop_sequence_records, FaultHandler};
use crate::storage::{StorageManager, Transaction};
use crate::validator::{validate_versions, ProtocolVersions};

/// A sequence offered by the initiator for traffic in the other direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOffer {
    pub sequence_id: String,
    /// Where messages on the offered sequence are sent.
    pub endpoint: String,
}

/// A decoded protocol control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    CreateSequence {
        message_id: String,
        acks_to: Option<String>,
        offer: Option<SequenceOffer>,
        #[serde(default)]
        versions: ProtocolVersions,
    },
    CreateSequenceResponse {
        /// Message id of the create-sequence request.
        relates_to: String,
        sequence_id: String,
        /// Whether the receiver accepted our offered sequence.
        #[serde(default)]
        offer_accepted: bool,
    },
    CreateSequenceRefused {
        relates_to: String,
        detail: String,
    },
    Acknowledgement {
        sequence_id: String,
        ranges: RangeSet,
    },
    AckRequested {
        sequence_id: String,
    },
    CloseSequence {
        message_id: String,
        sequence_id: String,
        last_message_number: Option<u64>,
    },
    CloseSequenceResponse {
        sequence_id: String,
    },
    TerminateSequence {
        message_id: String,
        sequence_id: String,
        last_message_number: Option<u64>,
    },
    TerminateSequenceResponse {
        sequence_id: String,
    },
    Fault(RmFault),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::CreateSequence { .. } => "create_sequence",
            ControlMessage::CreateSequenceResponse { .. } => "create_sequence_response",
            ControlMessage::CreateSequenceRefused { .. } => "create_sequence_refused",
            ControlMessage::Acknowledgement { .. } => "acknowledgement",
            ControlMessage::AckRequested { .. } => "ack_requested",
            ControlMessage::CloseSequence { .. } => "close_sequence",
            ControlMessage::CloseSequenceResponse { .. } => "close_sequence_response",
            ControlMessage::TerminateSequence { .. } => "terminate_sequence",
            ControlMessage::TerminateSequenceResponse { .. } => "terminate_sequence_response",
            ControlMessage::Fault(_) => "fault",
        }
    }
}

/// Result of handling a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Handled,
    /// A receiver sequence was created under this id.
    SequenceCreated(String),
    Acknowledged(AckOutcome),
    /// The request was refused. The binding layer answers with the fault.
    Refused(RmFault),
}

/// Applies control messages to the store.
pub struct ControlHandler {
    storage: Arc<dyn StorageManager>,
    faults: Arc<dyn FaultHandler>,
    policy: RmPolicy,
}

impl ControlHandler {
    pub fn new(storage: Arc<dyn StorageManager>, faults: Arc<dyn FaultHandler>, policy: RmPolicy) -> Self {
        Self {
            storage,
            faults,
            policy,
        }
    }

    pub async fn handle(&self, message: ControlMessage) -> Result<ControlOutcome> {
        self.handle_at(message, Utc::now()).await
    }

    pub async fn handle_at(&self, message: ControlMessage, now: DateTime<Utc>) -> Result<ControlOutcome> {
        debug!(kind = message.kind(), "control message received");

        let mut tx = self.storage.begin();
        let result = self.apply(&mut tx, message, now).await;
        let (outcome, fault) = tx.complete(result)?;

        if let Some(fault) = fault {
            self.faults.handle_fault(fault).await;
        }
        Ok(outcome)
    }

    async fn apply(
        &self,
        tx: &mut Transaction,
        message: ControlMessage,
        now: DateTime<Utc>,
    ) -> Result<(ControlOutcome, Option<EngineFault>)> {
        let storage = self.storage.as_ref();

        match message {
            ControlMessage::CreateSequence {
                message_id,
                acks_to,
                offer,
                versions,
            } => {
                let Some(acks_to) = acks_to else {
                    let fault = RmFault::new(
                        FaultCode::CreateSequenceRefused,
                        "",
                        "no acknowledgement endpoint was given",
                    );
                    warn!(message_id = %message_id, "create sequence refused");
                    return handled(ControlOutcome::Refused(fault));
                };
                let sequence_id = self
                    .create_inbound(tx, &message_id, acks_to, offer, &versions, now)
                    .await?;
                handled(ControlOutcome::SequenceCreated(sequence_id))
            }

            ControlMessage::CreateSequenceResponse {
                relates_to,
                sequence_id,
                offer_accepted,
            } => {
                self.establish(tx, &relates_to, &sequence_id, offer_accepted, now)
                    .await?;
                handled(ControlOutcome::Handled)
            }

            ControlMessage::CreateSequenceRefused { relates_to, detail } => {
                let mut rms = self.correlated(tx, &relates_to).await?;
                terminate_outbound(storage, tx, &mut rms, now).await?;
                let fault = RmFault::new(FaultCode::CreateSequenceRefused, rms.display_id(), detail);
                storage.rms().update(tx, rms).await?;
                Ok((ControlOutcome::Handled, Some(EngineFault::Protocol(fault))))
            }

            ControlMessage::Acknowledgement { sequence_id, ranges } => {
                let outcome = apply_acknowledgement(storage, tx, &sequence_id, &ranges, now).await?;
                handled(ControlOutcome::Acknowledged(outcome))
            }

            ControlMessage::AckRequested { sequence_id } => {
                let mut rmd = self.inbound(tx, &sequence_id).await?;
                rmd.touch(now);
                schedule_ack(storage, tx, &rmd, &self.policy, AckUrgency::Immediate, now).await?;
                storage.rmd().update(tx, rmd).await?;
                handled(ControlOutcome::Handled)
            }

            ControlMessage::CloseSequence {
                message_id,
                sequence_id,
                last_message_number,
            } => {
                let mut rmd = self.inbound(tx, &sequence_id).await?;
                if rmd.is_terminated() {
                    return Err(RmFault::terminated(&sequence_id).into());
                }
                rmd.advance(SequenceState::Closing)?;
                rmd.declare_last_message(last_message_number.unwrap_or(rmd.highest_in_message_number));
                rmd.touch(now);

                schedule_ack(storage, tx, &rmd, &self.policy, AckUrgency::Immediate, now).await?;
                let response = SenderRecord::control(MessageKind::CloseSequenceResponse, rmd.acks_to.clone(), now)
                    .on_sequence(sequence_id.clone())
                    .relating_to(message_id);
                storage.senders().insert(tx, response).await?;
                storage.rmd().update(tx, rmd).await?;

                info!(sequence_id = %sequence_id, "inbound sequence closed");
                handled(ControlOutcome::Handled)
            }

            ControlMessage::CloseSequenceResponse { sequence_id } => {
                let mut rms = self.outbound(tx, &sequence_id).await?;
                rms.touch(now);
                if rms.all_acknowledged() {
                    queue_terminate(storage, tx, &mut rms, now).await?;
                }
                storage.rms().update(tx, rms).await?;
                handled(ControlOutcome::Handled)
            }

            ControlMessage::TerminateSequence {
                message_id,
                sequence_id,
                last_message_number,
            } => {
                let mut rmd = self.inbound(tx, &sequence_id).await?;
                let first = !rmd.is_terminated();
                rmd.advance(SequenceState::Terminated)?;
                rmd.declare_last_message(last_message_number.unwrap_or(rmd.highest_in_message_number));
                rmd.touch(now);

                let response = SenderRecord::control(MessageKind::TerminateSequenceResponse, rmd.acks_to.clone(), now)
                    .on_sequence(sequence_id.clone())
                    .relating_to(message_id);
                storage.senders().insert(tx, response).await?;
                storage.rmd().update(tx, rmd).await?;

                if first {
                    info!(sequence_id = %sequence_id, "inbound sequence terminated");
                }
                handled(ControlOutcome::Handled)
            }

            ControlMessage::TerminateSequenceResponse { sequence_id } => {
                let mut rms = self.outbound(tx, &sequence_id).await?;
                rms.advance(SequenceState::Terminated)?;
                rms.touch(now);
                let removed = remove_outbound_messages(storage, tx, &rms.internal_sequence_id).await?;
                info!(
                    internal_sequence_id = %rms.internal_sequence_id,
                    sequence_id = %sequence_id,
                    removed,
                    "outbound sequence terminated"
                );
                storage.rms().update(tx, rms).await?;
                handled(ControlOutcome::Handled)
            }

            ControlMessage::Fault(fault) => {
                let fatal = matches!(fault.code, FaultCode::SequenceTerminated | FaultCode::UnknownSequence);
                if fatal {
                    let found = storage
                        .rms()
                        .find_unique(tx, &RmsFinder::by_sequence_id(fault.sequence_id.clone()))
                        .await?;
                    if let Some(mut rms) = found {
                        terminate_outbound(storage, tx, &mut rms, now).await?;
                        storage.rms().update(tx, rms).await?;
                    }
                }
                Ok((ControlOutcome::Handled, Some(EngineFault::Protocol(fault))))
            }
        }
    }

    async fn create_inbound(
        &self,
        tx: &mut Transaction,
        message_id: &str,
        acks_to: String,
        offer: Option<SequenceOffer>,
        versions: &ProtocolVersions,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let storage = self.storage.as_ref();
        let sequence_id = format!("urn:uuid:{}", Uuid::new_v4());

        // Replies to this sequence travel on the offered one, keyed by our id.
        if let Some(offer) = &offer {
            let mut reverse = RmsRecord::new(sequence_id.clone(), offer.endpoint.clone(), now);
            reverse.sequence_id = Some(offer.sequence_id.clone());
            reverse.advance(SequenceState::Established)?;
            storage.rms().insert(tx, reverse).await?;
        }

        let rmd = RmdRecord::new(sequence_id.clone(), acks_to.clone(), self.policy.invoke_in_order, now);
        storage.rmd().insert(tx, rmd).await?;
        validate_versions(storage, tx, &sequence_id, versions).await?;

        let response = SenderRecord::control(MessageKind::CreateSequenceResponse, acks_to, now)
            .on_sequence(sequence_id.clone())
            .relating_to(message_id);
        storage.senders().insert(tx, response).await?;

        info!(
            sequence_id = %sequence_id,
            offered = ?offer.as_ref().map(|o| &o.sequence_id),
            in_order = self.policy.invoke_in_order,
            "inbound sequence created"
        );
        Ok(sequence_id)
    }

    async fn establish(
        &self,
        tx: &mut Transaction,
        create_sequence_message_id: &str,
        sequence_id: &str,
        offer_accepted: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let storage = self.storage.as_ref();

        let Some(mut correlation) = storage.create_sequences().retrieve(tx, create_sequence_message_id).await? else {
            return Err(RmFault::unknown_sequence(sequence_id).into());
        };
        let mut rms = retrieve_rms(storage, tx, &correlation.internal_sequence_id).await?;

        if rms.state != SequenceState::Unestablished {
            debug!(internal_sequence_id = %rms.internal_sequence_id, "repeated create sequence response");
            return Ok(());
        }
        correlation.sequence_id = Some(sequence_id.to_string());
        storage.create_sequences().update(tx, correlation).await?;

        rms.sequence_id = Some(sequence_id.to_string());
        rms.advance(SequenceState::Established)?;
        rms.touch(now);

        if offer_accepted {
            if let Some(offered) = &rms.offered_sequence_id {
                let endpoint = rms.offered_endpoint.clone().unwrap_or_else(|| rms.destination.clone());
                let rmd = RmdRecord::new(offered.clone(), endpoint, self.policy.invoke_in_order, now);
                storage.rmd().insert(tx, rmd).await?;
            }
        }

        storage.senders().delete(tx, create_sequence_message_id).await?;

        info!(
            internal_sequence_id = %rms.internal_sequence_id,
            sequence_id = %sequence_id,
            "outbound sequence established"
        );
        storage.rms().update(tx, rms).await?;
        Ok(())
    }

    async fn correlated(&self, tx: &mut Transaction, create_sequence_message_id: &str) -> Result<RmsRecord> {
        let storage = self.storage.as_ref();
        let finder = CreateSequenceFinder {
            create_sequence_message_id: Some(create_sequence_message_id.to_string()),
            ..Default::default()
        };
        let Some(correlation) = storage.create_sequences().find_unique(tx, &finder).await? else {
            return Err(RmFault::unknown_sequence(create_sequence_message_id).into());
        };
        retrieve_rms(storage, tx, &correlation.internal_sequence_id).await
    }

    async fn inbound(&self, tx: &mut Transaction, sequence_id: &str) -> Result<RmdRecord> {
        self.storage
            .rmd()
            .retrieve(tx, sequence_id)
            .await?
            .ok_or_else(|| RmFault::unknown_sequence(sequence_id).into())
    }

    async fn outbound(&self, tx: &mut Transaction, sequence_id: &str) -> Result<RmsRecord> {
        self.storage
            .rms()
            .find_unique(tx, &RmsFinder::by_sequence_id(sequence_id))
            .await?
            .ok_or_else(|| RmFault::unknown_sequence(sequence_id).into())
    }
}

impl std::fmt::Debug for ControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandler").field("policy", &self.policy).finish()
    }
}

fn handled(outcome: ControlOutcome) -> Result<(ControlOutcome, Option<EngineFault>)> {
    Ok((outcome, None))
}

async fn retrieve_rms(storage: &dyn StorageManager, tx: &mut Transaction, internal_sequence_id: &str) -> Result<RmsRecord> {
    storage
        .rms()
        .retrieve(tx, internal_sequence_id)
        .await?
        .ok_or_else(|| {
            InternalFault::Inconsistent(format!(
                "create sequence correlation points at missing sequence {internal_sequence_id}"
            ))
            .into()
        })
}

/// Terminate `rms` and stop its pending messages. The caller writes it back.
async fn terminate_outbound(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    rms: &mut RmsRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    rms.advance(SequenceState::Terminated)?;
    rms.touch(now);
    let stopped = stop_sequence_records(storage, tx, &rms.internal_sequence_id).await?;
    info!(
        internal_sequence_id = %rms.internal_sequence_id,
        stopped,
        "outbound sequence terminated by peer"
    );
    Ok(())
}

/// Delete every sender record of an outbound sequence and its payload.
pub(crate) async fn remove_outbound_messages(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    internal_sequence_id: &str,
) -> Result<usize> {
    let records = storage
        .senders()
        .find(tx, &SenderFinder::for_internal_sequence(internal_sequence_id))
        .await?;
    let count = records.len();
    for record in records {
        storage.senders().delete(tx, &record.message_id).await?;
        if let Some(key) = &record.payload_key {
            storage.payloads().delete(tx, key).await?;
        }
    }
    Ok(count)
}
