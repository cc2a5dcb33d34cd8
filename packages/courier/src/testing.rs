//! Test doubles for courier collaborators.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! courier = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use courier::testing::{test_policy, RecordingApplication, RecordingTransport};
//!
//! let transport = Arc::new(RecordingTransport::new());
//! let app = Arc::new(RecordingApplication::new());
//! let engine = EngineBuilder::new(Arc::new(InMemoryStorageManager::default()))
//!     .with_policy(test_policy())
//!     .with_shared_transport(transport.clone())
//!     .with_shared_application(app.clone())
//!     .build()?;
//!
//! transport.fail_next(2); // the first two transmissions fail
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::error::Elapsed;

use crate::config::RmPolicy;
use crate::error::EngineFault;
use crate::invoker::Application;
use crate::records::MessageKind;
use crate::sender::{FaultHandler, OutboundMessage, Transport};

/// Take one pending failure, if any are left.
fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Wait until `ready` holds, re-checking whenever `notify` fires.
async fn wait_until(notify: &Notify, timeout: Duration, ready: impl Fn() -> bool) -> Result<(), Elapsed> {
    tokio::time::timeout(timeout, async {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready() {
                return;
            }
            notified.await;
        }
    })
    .await
}

// =============================================================================
// Transport
// =============================================================================

/// Transport that records every message it is handed.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: AtomicUsize,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` transmissions. Failed messages are not recorded.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every message transmitted successfully, in order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_of(&self, kind: MessageKind) -> Vec<OutboundMessage> {
        self.sent().into_iter().filter(|m| m.kind == kind).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    /// Wait until at least `count` messages were transmitted.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<(), Elapsed> {
        wait_until(&self.notify, timeout, || self.sent().len() >= count).await
    }

    /// Wait until at least `count` messages of `kind` were transmitted.
    pub async fn wait_for_kind(&self, kind: MessageKind, count: usize, timeout: Duration) -> Result<(), Elapsed> {
        wait_until(&self.notify, timeout, || self.sent_of(kind).len() >= count).await
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn transmit(&self, message: OutboundMessage) -> anyhow::Result<()> {
        if take_failure(&self.failures) {
            anyhow::bail!("connection refused");
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// Application
// =============================================================================

/// One delivery seen by a [`RecordingApplication`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sequence_id: String,
    pub message_number: u64,
    pub payload: Bytes,
}

/// Application that records deliveries and can be told to fail.
#[derive(Default)]
pub struct RecordingApplication {
    deliveries: Mutex<Vec<Delivery>>,
    failures: AtomicUsize,
    notify: Notify,
}

impl RecordingApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` invocations.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Message numbers delivered on `sequence_id`, in delivery order.
    pub fn numbers(&self, sequence_id: &str) -> Vec<u64> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.sequence_id == sequence_id)
            .map(|d| d.message_number)
            .collect()
    }

    /// Wait until at least `count` messages were delivered.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<(), Elapsed> {
        wait_until(&self.notify, timeout, || self.deliveries().len() >= count).await
    }
}

#[async_trait]
impl Application for RecordingApplication {
    async fn invoke(&self, payload: Bytes, sequence_id: &str, message_number: u64) -> anyhow::Result<()> {
        if take_failure(&self.failures) {
            anyhow::bail!("application unavailable");
        }
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(Delivery {
                sequence_id: sequence_id.to_string(),
                message_number,
                payload,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// Faults
// =============================================================================

/// Fault handler that keeps every fault.
#[derive(Default)]
pub struct CollectingFaultHandler {
    faults: Mutex<Vec<EngineFault>>,
}

impl CollectingFaultHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<EngineFault> {
        self.faults.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FaultHandler for CollectingFaultHandler {
    async fn handle_fault(&self, fault: EngineFault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }
}

// =============================================================================
// Policy and Tracing
// =============================================================================

/// A policy with millisecond timings, for tests that run the loops.
pub fn test_policy() -> RmPolicy {
    RmPolicy::default()
        .with_retransmission_interval(Duration::from_millis(50))
        .with_acknowledgement_interval(Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(5))
        .with_lock_timeout(Some(Duration::from_secs(2)))
}

/// Install a tracing subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_failures_are_consumed() {
        let transport = RecordingTransport::new();
        transport.fail_next(1);
        let message = OutboundMessage {
            message_id: "m".into(),
            kind: MessageKind::Acknowledgement,
            destination: "d".into(),
            internal_sequence_id: None,
            sequence_id: None,
            message_number: None,
            last_message: false,
            relates_to: None,
            offered_sequence_id: None,
            acknowledgement: None,
            fault: None,
            payload: None,
            attempt: 1,
        };
        assert!(transport.transmit(message.clone()).await.is_err());
        assert!(transport.transmit(message).await.is_ok());
        assert_eq!(transport.sent().len(), 1);
        transport.wait_for(1, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let app = RecordingApplication::new();
        assert!(app.wait_for(1, Duration::from_millis(10)).await.is_err());
    }
}
