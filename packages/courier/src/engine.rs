//! The courier engine: client operations, inbound entry points and the
//! background loops, wired to one storage manager.
//!
//! # Usage
//!
//! ```ignore
//! use courier::{EngineBuilder, InMemoryStorageManager, RmPolicy, SequenceOptions};
//!
//! let policy = RmPolicy::from_env()?;
//! let storage = Arc::new(InMemoryStorageManager::new(policy.lock_timeout));
//!
//! let engine = EngineBuilder::new(storage)
//!     .with_policy(policy)
//!     .with_transport(HttpTransport::new(client))
//!     .with_application(OrderHandler::new(db))
//!     .build()?;
//!
//! let handle = engine.start();
//!
//! engine.create_sequence("orders", SequenceOptions::new("http://peer/rm")).await?;
//! // ... once the peer answered with a create-sequence response:
//! let n = engine.send("orders", Bytes::from_static(b"<order/>")).await?;
//!
//! handle.shutdown().await;
//! ```
//!
//! # Inbound Traffic
//!
//! The binding layer decodes what it receives and calls
//! [`Engine::handle_inbound_application_message`] or
//! [`Engine::handle_inbound_control_message`]. Both return once the message
//! is durably applied. Delivery to the application and all outbound traffic
//! happen on the background loops started by [`Engine::start`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acks::queue_terminate;
use crate::config::{ConfigError, RmPolicy};
use crate::control::{ControlHandler, ControlMessage, ControlOutcome};
use crate::error::{CourierError, Result, RmFault};
use crate::housekeeping::Housekeeper;
use crate::invoker::{AcceptOutcome, Application, InboundMessage, Invoker};
use crate::records::{
    CreateSequenceRecord, MessageKind, RmsRecord, SenderFinder, SenderRecord, SequenceState,
    StoredPayload,
};
use crate::report::{endpoint_report, sequence_report, EndpointReport, SequenceReport};
use crate::sender::{stop_sequence_records, FaultHandler, LoggingFaultHandler, Sender, Transport};
use crate::storage::{StorageManager, Transaction};
use crate::validator::{validate_versions, ProtocolVersions};

// =============================================================================
// Sequence Options
// =============================================================================

/// Options for a new outbound sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOptions {
    /// Endpoint the sequence's messages are sent to.
    pub destination: String,
    /// Offer a sequence for replies in the other direction.
    pub offered_sequence_id: Option<String>,
    /// Where replies on the offered sequence should be acknowledged.
    pub offered_endpoint: Option<String>,
    pub versions: ProtocolVersions,
}

impl SequenceOptions {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_offer(mut self, sequence_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.offered_sequence_id = Some(sequence_id.into());
        self.offered_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_versions(mut self, versions: ProtocolVersions) -> Self {
        self.versions = versions;
        self
    }
}

/// How a wait on an outbound sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceCompletion {
    /// Every allocated message was acknowledged.
    Acknowledged,
    Terminated,
    /// Retransmissions ran out.
    TimedOut,
    /// The wait ended first.
    StillPending,
}

// =============================================================================
// Engine
// =============================================================================

/// Entry point for everything courier does. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    storage: Arc<dyn StorageManager>,
    policy: RmPolicy,
    sender: Arc<Sender>,
    invoker: Arc<Invoker>,
    control: Arc<ControlHandler>,
    housekeeper: Arc<Housekeeper>,
    /// Fires after every inbound control message.
    progress: Arc<Notify>,
}

impl Engine {
    pub fn builder(storage: Arc<dyn StorageManager>) -> EngineBuilder {
        EngineBuilder::new(storage)
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn policy(&self) -> &RmPolicy {
        &self.policy
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    pub fn housekeeper(&self) -> &Arc<Housekeeper> {
        &self.housekeeper
    }

    /// Start the sender, invoker and housekeeping loops.
    pub fn start(&self) -> EngineHandle {
        info!("starting courier engine");

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(self.sender.clone().run(shutdown.child_token())),
            tokio::spawn(self.invoker.clone().run(shutdown.child_token())),
            tokio::spawn(self.housekeeper.clone().run(shutdown.child_token())),
        ];

        EngineHandle { shutdown, tasks }
    }

    // -------------------------------------------------------------------------
    // Client operations
    // -------------------------------------------------------------------------

    /// Open an outbound sequence under `internal_sequence_id`.
    ///
    /// Queues the create-sequence request and returns its message id.
    /// Fails with `DuplicateKey` if the internal id is already in use.
    pub async fn create_sequence(&self, internal_sequence_id: &str, options: SequenceOptions) -> Result<String> {
        let now = Utc::now();
        let mut tx = self.storage.begin();
        let result = self.create_sequence_in(&mut tx, internal_sequence_id, options, now).await;
        let message_id = tx.complete(result)?;
        self.sender.wake();
        Ok(message_id)
    }

    async fn create_sequence_in(
        &self,
        tx: &mut Transaction,
        internal_sequence_id: &str,
        options: SequenceOptions,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let storage = self.storage.as_ref();
        let request = SenderRecord::control(MessageKind::CreateSequence, options.destination.clone(), now)
            .for_outbound(internal_sequence_id);
        let message_id = request.message_id.clone();

        storage
            .create_sequences()
            .insert(
                tx,
                CreateSequenceRecord {
                    create_sequence_message_id: message_id.clone(),
                    internal_sequence_id: internal_sequence_id.to_string(),
                    sequence_id: None,
                    created_at: now,
                },
            )
            .await?;

        let mut rms = RmsRecord::new(internal_sequence_id, options.destination, now);
        rms.create_sequence_message_id = Some(message_id.clone());
        rms.offered_sequence_id = options.offered_sequence_id;
        rms.offered_endpoint = options.offered_endpoint;
        storage.rms().insert(tx, rms).await?;
        validate_versions(storage, tx, internal_sequence_id, &options.versions).await?;
        storage.senders().insert(tx, request).await?;

        info!(internal_sequence_id, message_id = %message_id, "outbound sequence requested");
        Ok(message_id)
    }

    /// Queue `payload` on an established sequence. Returns its message number.
    pub async fn send(&self, internal_sequence_id: &str, payload: Bytes) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.storage.begin();
        let result = self.send_in(&mut tx, internal_sequence_id, payload, now).await;
        let n = tx.complete(result)?;
        self.sender.wake();
        Ok(n)
    }

    async fn send_in(
        &self,
        tx: &mut Transaction,
        internal_sequence_id: &str,
        payload: Bytes,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let storage = self.storage.as_ref();
        let mut rms = self.outbound(tx, internal_sequence_id).await?;
        if !rms.is_established() || rms.timed_out {
            return Err(CourierError::NotEstablished {
                internal_sequence_id: internal_sequence_id.to_string(),
                state: rms.state,
            });
        }
        let Some(sequence_id) = rms.sequence_id.clone() else {
            return Err(CourierError::NotEstablished {
                internal_sequence_id: internal_sequence_id.to_string(),
                state: rms.state,
            });
        };

        let n = rms.allocate_message_number()?;
        let payload = StoredPayload::new(payload, now);
        let record = SenderRecord::application(
            internal_sequence_id,
            sequence_id,
            rms.destination.clone(),
            n,
            payload.key.clone(),
            now,
        );
        storage.senders().insert(tx, record).await?;
        storage.payloads().insert(tx, payload).await?;
        rms.touch(now);
        storage.rms().update(tx, rms).await?;
        Ok(n)
    }

    /// Close an outbound sequence to new messages.
    ///
    /// The sequence terminates once every message is acknowledged.
    pub async fn close_sequence(&self, internal_sequence_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.storage.begin();
        let result = self.close_sequence_in(&mut tx, internal_sequence_id, now).await;
        tx.complete(result)?;
        self.sender.wake();
        Ok(())
    }

    async fn close_sequence_in(&self, tx: &mut Transaction, internal_sequence_id: &str, now: DateTime<Utc>) -> Result<()> {
        let storage = self.storage.as_ref();
        let mut rms = self.outbound(tx, internal_sequence_id).await?;
        match rms.state {
            SequenceState::Established => {}
            SequenceState::Closing => return Ok(()),
            SequenceState::Terminated => return Err(RmFault::terminated(rms.display_id()).into()),
            SequenceState::Unestablished => {
                return Err(CourierError::NotEstablished {
                    internal_sequence_id: internal_sequence_id.to_string(),
                    state: rms.state,
                })
            }
        }
        let Some(sequence_id) = rms.sequence_id.clone() else {
            return Err(CourierError::NotEstablished {
                internal_sequence_id: internal_sequence_id.to_string(),
                state: rms.state,
            });
        };

        rms.advance(SequenceState::Closing)?;
        rms.closed_by_client = true;
        rms.last_out_message_number = Some(rms.highest_out_message_number);
        rms.touch(now);

        let close = SenderRecord::control(MessageKind::CloseSequence, rms.destination.clone(), now)
            .for_outbound(internal_sequence_id)
            .on_sequence(sequence_id)
            .numbered(rms.highest_out_message_number);
        storage.senders().insert(tx, close).await?;
        if rms.all_acknowledged() {
            queue_terminate(storage, tx, &mut rms, now).await?;
        }

        info!(
            internal_sequence_id,
            last_message_number = rms.highest_out_message_number,
            "outbound sequence closing"
        );
        storage.rms().update(tx, rms).await?;
        Ok(())
    }

    /// Terminate an outbound sequence.
    ///
    /// Refused with [`CourierError::PendingMessages`] while messages are
    /// neither acknowledged nor exhausted. A timed out sequence is terminated
    /// locally, since nothing more will be sent on it.
    pub async fn terminate_sequence(&self, internal_sequence_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.storage.begin();
        let result = self.terminate_sequence_in(&mut tx, internal_sequence_id, now).await;
        tx.complete(result)?;
        self.sender.wake();
        Ok(())
    }

    async fn terminate_sequence_in(
        &self,
        tx: &mut Transaction,
        internal_sequence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let storage = self.storage.as_ref();
        let mut rms = self.outbound(tx, internal_sequence_id).await?;
        if rms.is_terminated() || rms.terminate_added {
            return Ok(());
        }

        if rms.timed_out {
            rms.advance(SequenceState::Terminated)?;
            rms.touch(now);
            stop_sequence_records(storage, tx, internal_sequence_id).await?;
            info!(internal_sequence_id, "timed out sequence terminated locally");
        } else {
            if rms.sequence_id.is_none() {
                return Err(CourierError::NotEstablished {
                    internal_sequence_id: internal_sequence_id.to_string(),
                    state: rms.state,
                });
            }
            let pending = rms.unacknowledged().count();
            if pending > 0 {
                return Err(CourierError::PendingMessages {
                    internal_sequence_id: internal_sequence_id.to_string(),
                    pending,
                });
            }
            queue_terminate(storage, tx, &mut rms, now).await?;
        }

        storage.rms().update(tx, rms).await?;
        Ok(())
    }

    /// Ask the peer to acknowledge an established outbound sequence now.
    ///
    /// A request already waiting to go out is reused.
    pub async fn send_ack_request(&self, internal_sequence_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.storage.begin();
        let result = self.send_ack_request_in(&mut tx, internal_sequence_id, now).await;
        tx.complete(result)?;
        self.sender.wake();
        Ok(())
    }

    async fn send_ack_request_in(
        &self,
        tx: &mut Transaction,
        internal_sequence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let storage = self.storage.as_ref();
        let rms = self.outbound(tx, internal_sequence_id).await?;
        if rms.is_finished() {
            return Err(RmFault::terminated(rms.display_id()).into());
        }
        let Some(sequence_id) = rms.sequence_id.clone() else {
            return Err(CourierError::NotEstablished {
                internal_sequence_id: internal_sequence_id.to_string(),
                state: rms.state,
            });
        };

        let finder = SenderFinder {
            kind: Some(MessageKind::AckRequested),
            send: Some(true),
            ..SenderFinder::for_internal_sequence(internal_sequence_id)
        };
        if !storage.senders().find(tx, &finder).await?.is_empty() {
            debug!(internal_sequence_id, "ack request already queued");
            return Ok(());
        }

        let request = SenderRecord::control(MessageKind::AckRequested, rms.destination.clone(), now)
            .for_outbound(internal_sequence_id)
            .on_sequence(sequence_id);
        storage.senders().insert(tx, request).await?;
        debug!(internal_sequence_id, "ack request queued");
        Ok(())
    }

    /// Wait until an outbound sequence is fully acknowledged, terminated or
    /// timed out. `None` waits without limit.
    pub async fn wait_until_sequence_completed(
        &self,
        internal_sequence_id: &str,
        timeout: Option<Duration>,
    ) -> Result<SequenceCompletion> {
        let wait = self.wait_for_completion(internal_sequence_id);
        match timeout {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(internal_sequence_id, ?limit, "sequence still pending after wait");
                    Ok(SequenceCompletion::StillPending)
                }
            },
        }
    }

    async fn wait_for_completion(&self, internal_sequence_id: &str) -> Result<SequenceCompletion> {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut tx = self.storage.begin();
            let result = self.outbound(&mut tx, internal_sequence_id).await;
            let rms = tx.complete(result)?;
            if rms.timed_out {
                return Ok(SequenceCompletion::TimedOut);
            }
            if rms.is_terminated() {
                return Ok(SequenceCompletion::Terminated);
            }
            if rms.sequence_id.is_some() && rms.all_acknowledged() {
                return Ok(SequenceCompletion::Acknowledged);
            }

            // Timeouts are decided by the sender loop, which does not notify.
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.policy.sender_poll_interval) => {}
            }
        }
    }

    /// Report on a sequence by internal id, outbound id or inbound id.
    pub async fn sequence_report(&self, id: &str) -> Result<Option<SequenceReport>> {
        let mut tx = self.storage.begin();
        let result = sequence_report(self.storage.as_ref(), &mut tx, id).await;
        tx.complete(result)
    }

    /// Report on every sequence, outbound and inbound.
    pub async fn endpoint_report(&self) -> Result<EndpointReport> {
        let mut tx = self.storage.begin();
        let result = endpoint_report(self.storage.as_ref(), &mut tx).await;
        tx.complete(result)
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    pub async fn handle_inbound_application_message(&self, message: InboundMessage) -> Result<AcceptOutcome> {
        let outcome = self.invoker.accept(message).await?;
        if outcome == AcceptOutcome::Duplicate {
            self.sender.wake();
        }
        Ok(outcome)
    }

    pub async fn handle_inbound_control_message(&self, message: ControlMessage) -> Result<ControlOutcome> {
        let outcome = self.control.handle(message).await;
        self.progress.notify_waiters();
        let outcome = outcome?;
        self.sender.wake();
        Ok(outcome)
    }

    /// Deliver every pending message of an inbound sequence now, ignoring
    /// gaps. See [`Invoker::force_invoke`].
    pub async fn force_invoke(&self, sequence_id: &str, allow_late: bool) -> Result<usize> {
        self.invoker.force_invoke(sequence_id, allow_late).await
    }

    async fn outbound(&self, tx: &mut Transaction, internal_sequence_id: &str) -> Result<RmsRecord> {
        self.storage
            .rms()
            .retrieve(tx, internal_sequence_id)
            .await?
            .ok_or_else(|| CourierError::UnknownInternalSequence(internal_sequence_id.to_string()))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle to the background loops of a started engine.
pub struct EngineHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Token cancelled when the engine shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the loops and wait for them to finish their current step.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("courier engine stopped");
    }

    /// Abort the loops without waiting.
    pub fn abort(&self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("tasks", &self.tasks.len())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for [`Engine`].
///
/// A transport and an application are required. Faults are logged unless a
/// handler is supplied.
pub struct EngineBuilder {
    storage: Arc<dyn StorageManager>,
    policy: RmPolicy,
    transport: Option<Arc<dyn Transport>>,
    application: Option<Arc<dyn Application>>,
    faults: Arc<dyn FaultHandler>,
}

impl EngineBuilder {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self {
            storage,
            policy: RmPolicy::default(),
            transport: None,
            application: None,
            faults: Arc::new(LoggingFaultHandler),
        }
    }

    pub fn with_policy(mut self, policy: RmPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_application(mut self, application: impl Application + 'static) -> Self {
        self.application = Some(Arc::new(application));
        self
    }

    pub fn with_shared_application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    pub fn with_fault_handler(mut self, faults: Arc<dyn FaultHandler>) -> Self {
        self.faults = faults;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.policy.validate()?;
        let transport = self.transport.ok_or(ConfigError::Missing("transport"))?;
        let application = self.application.ok_or(ConfigError::Missing("application"))?;

        let sender = Sender::new(
            self.storage.clone(),
            transport,
            self.faults.clone(),
            self.policy.clone(),
        );
        let invoker = Invoker::new(self.storage.clone(), application, self.policy.clone());
        let control = ControlHandler::new(self.storage.clone(), self.faults.clone(), self.policy.clone());
        let housekeeper = Housekeeper::new(self.storage.clone(), self.faults, self.policy.clone());

        Ok(Engine {
            storage: self.storage,
            policy: self.policy,
            sender: Arc::new(sender),
            invoker: Arc::new(invoker),
            control: Arc::new(control),
            housekeeper: Arc::new(housekeeper),
            progress: Arc::new(Notify::new()),
        })
    }
}
