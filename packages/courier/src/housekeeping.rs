//! Inactivity timeouts and removal of finished sequences.
//!
//! Both sweeps are off unless the policy sets
//! [`inactivity_timeout`](RmPolicy::inactivity_timeout) or
//! [`sequence_removal_timeout`](RmPolicy::sequence_removal_timeout).
//! Candidates are listed in one short transaction and each sequence is then
//! handled in its own, re-checked under lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{elapsed_since, RmPolicy};
use crate::control::remove_outbound_messages;
use crate::error::{EngineFault, Result};
use crate::records::{
    CreateSequenceFinder, InvokerFinder, PropertyFinder, RmdFinder, RmsFinder, SenderFinder, SequenceState,
};
use crate::sender::{time_out_sequence, FaultHandler};
use crate::storage::{Record, StorageManager, Transaction};

/// What one housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    /// Outbound sequences given up for inactivity, by internal id.
    pub timed_out_outbound: Vec<String>,
    /// Inbound sequences terminated for inactivity.
    pub terminated_inbound: Vec<String>,
    pub removed_outbound: Vec<String>,
    pub removed_inbound: Vec<String>,
}

impl HousekeepingReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_outbound.is_empty()
            && self.terminated_inbound.is_empty()
            && self.removed_outbound.is_empty()
            && self.removed_inbound.is_empty()
    }
}

pub struct Housekeeper {
    storage: Arc<dyn StorageManager>,
    faults: Arc<dyn FaultHandler>,
    policy: RmPolicy,
}

impl Housekeeper {
    pub fn new(storage: Arc<dyn StorageManager>, faults: Arc<dyn FaultHandler>, policy: RmPolicy) -> Self {
        Self {
            storage,
            faults,
            policy,
        }
    }

    pub async fn run_once(&self) -> Result<HousekeepingReport> {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();

        if let Some(timeout) = self.policy.inactivity_timeout {
            self.expire_outbound(now, timeout, &mut report).await?;
            self.expire_inbound(now, timeout, &mut report).await?;
        }
        if let Some(timeout) = self.policy.sequence_removal_timeout {
            self.remove_outbound(now, timeout, &mut report).await?;
            self.remove_inbound(now, timeout, &mut report).await?;
        }

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out_outbound.len(),
                terminated = report.terminated_inbound.len(),
                removed_outbound = report.removed_outbound.len(),
                removed_inbound = report.removed_inbound.len(),
                "housekeeping pass finished"
            );
        }
        Ok(report)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.policy.housekeeping_interval, "housekeeping started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.policy.housekeeping_interval) => {}
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, retryable = e.is_retryable(), "housekeeping pass failed");
            }
        }

        info!("housekeeping stopped");
    }

    async fn outbound_ids(&self) -> Result<Vec<String>> {
        let mut tx = self.storage.begin();
        let found = self.storage.rms().find(&mut tx, &RmsFinder::default()).await;
        Ok(tx.complete(found)?.into_iter().map(|r| r.internal_sequence_id).collect())
    }

    async fn inbound_ids(&self) -> Result<Vec<String>> {
        let mut tx = self.storage.begin();
        let found = self.storage.rmd().find(&mut tx, &RmdFinder::default()).await;
        Ok(tx.complete(found)?.into_iter().map(|r| r.sequence_id).collect())
    }

    async fn expire_outbound(&self, now: DateTime<Utc>, timeout: Duration, report: &mut HousekeepingReport) -> Result<()> {
        for id in self.outbound_ids().await? {
            let mut tx = self.storage.begin();
            let result: Result<Option<EngineFault>> = async {
                let storage = self.storage.as_ref();
                let Some(mut rms) = storage.rms().retrieve(&mut tx, &id).await? else {
                    return Ok(None);
                };
                let idle = elapsed_since(rms.last_activated, now);
                if rms.is_finished() || idle <= timeout {
                    return Ok(None);
                }
                time_out_sequence(storage, &mut tx, &mut rms, now).await?;
                Ok(Some(EngineFault::InactivityTimeout {
                    internal_sequence_id: rms.internal_sequence_id.clone(),
                    sequence_id: rms.sequence_id.clone(),
                    idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                }))
            }
            .await;

            if let Some(fault) = tx.complete(result)? {
                report.timed_out_outbound.push(id);
                self.faults.handle_fault(fault).await;
            }
        }
        Ok(())
    }

    async fn expire_inbound(&self, now: DateTime<Utc>, timeout: Duration, report: &mut HousekeepingReport) -> Result<()> {
        for id in self.inbound_ids().await? {
            let mut tx = self.storage.begin();
            let result: Result<bool> = async {
                let Some(mut rmd) = self.storage.rmd().retrieve(&mut tx, &id).await? else {
                    return Ok(false);
                };
                if rmd.is_terminated() || elapsed_since(rmd.last_activated, now) <= timeout {
                    return Ok(false);
                }
                rmd.advance(SequenceState::Terminated)?;
                info!(sequence_id = %id, "inbound sequence terminated for inactivity");
                self.storage.rmd().update(&mut tx, rmd).await?;
                Ok(true)
            }
            .await;

            if tx.complete(result)? {
                report.terminated_inbound.push(id);
            }
        }
        Ok(())
    }

    async fn remove_outbound(&self, now: DateTime<Utc>, timeout: Duration, report: &mut HousekeepingReport) -> Result<()> {
        for id in self.outbound_ids().await? {
            let mut tx = self.storage.begin();
            let result = self.remove_outbound_one(&mut tx, &id, now, timeout).await;
            if tx.complete(result)? {
                report.removed_outbound.push(id);
            }
        }
        Ok(())
    }

    async fn remove_outbound_one(
        &self,
        tx: &mut Transaction,
        internal_sequence_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        let storage = self.storage.as_ref();

        let correlations = storage
            .create_sequences()
            .find(
                tx,
                &CreateSequenceFinder {
                    internal_sequence_id: Some(internal_sequence_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let Some(rms) = storage.rms().retrieve(tx, internal_sequence_id).await? else {
            return Ok(false);
        };
        if !rms.is_finished() || elapsed_since(rms.last_activated, now) <= timeout {
            return Ok(false);
        }

        let properties = storage
            .properties()
            .find(
                tx,
                &PropertyFinder {
                    sequence_key: Some(internal_sequence_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        for property in properties {
            storage.properties().delete(tx, &property.key()).await?;
        }
        let messages = remove_outbound_messages(storage, tx, internal_sequence_id).await?;
        for correlation in correlations {
            storage
                .create_sequences()
                .delete(tx, &correlation.create_sequence_message_id)
                .await?;
        }
        storage.rms().delete(tx, internal_sequence_id).await?;

        debug!(internal_sequence_id, messages, "outbound sequence removed");
        Ok(true)
    }

    async fn remove_inbound(&self, now: DateTime<Utc>, timeout: Duration, report: &mut HousekeepingReport) -> Result<()> {
        for id in self.inbound_ids().await? {
            let mut tx = self.storage.begin();
            let result = self.remove_inbound_one(&mut tx, &id, now, timeout).await;
            if tx.complete(result)? {
                report.removed_inbound.push(id);
            }
        }
        Ok(())
    }

    async fn remove_inbound_one(
        &self,
        tx: &mut Transaction,
        sequence_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        let storage = self.storage.as_ref();

        let Some(rmd) = storage.rmd().retrieve(tx, sequence_id).await? else {
            return Ok(false);
        };
        if !rmd.is_terminated() || elapsed_since(rmd.last_activated, now) <= timeout {
            return Ok(false);
        }

        let properties = storage
            .properties()
            .find(
                tx,
                &PropertyFinder {
                    sequence_key: Some(sequence_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let replies = storage
            .senders()
            .find(
                tx,
                &SenderFinder {
                    sequence_id: Some(sequence_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let invokers = storage
            .invokers()
            .find(
                tx,
                &InvokerFinder {
                    sequence_id: Some(sequence_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if invokers.iter().any(|r| !r.invoked) {
            return Ok(false);
        }

        for property in properties {
            storage.properties().delete(tx, &property.key()).await?;
        }
        // Outbound messages of an offered sequence share the id but belong
        // to that sequence's own lifecycle.
        for reply in replies.iter().filter(|r| r.internal_sequence_id.is_none()) {
            storage.senders().delete(tx, &reply.message_id).await?;
        }
        for record in &invokers {
            storage.invokers().delete(tx, &record.payload_key).await?;
            storage.payloads().delete(tx, &record.payload_key).await?;
        }
        storage.rmd().delete(tx, sequence_id).await?;

        debug!(sequence_id, delivered = invokers.len(), "inbound sequence removed");
        Ok(true)
    }
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper").field("policy", &self.policy).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InvokerRecord, RmdRecord, RmsRecord, SenderRecord, SequenceProperty};
    use crate::storage::InMemoryStorageManager;
    use crate::testing::CollectingFaultHandler;
    use chrono::Duration as ChronoDuration;

    fn housekeeper(policy: RmPolicy) -> (Arc<InMemoryStorageManager>, Arc<CollectingFaultHandler>, Housekeeper) {
        let storage = Arc::new(InMemoryStorageManager::default());
        let faults = Arc::new(CollectingFaultHandler::new());
        let housekeeper = Housekeeper::new(storage.clone(), faults.clone(), policy);
        (storage, faults, housekeeper)
    }

    async fn seed(storage: &InMemoryStorageManager, then: DateTime<Utc>) {
        let mut tx = storage.begin();
        let mut rms = RmsRecord::new("client-1", "http://peer", then);
        rms.sequence_id = Some("s-1".into());
        rms.state = SequenceState::Established;
        let n = rms.allocate_message_number().unwrap();
        storage.rms().insert(&mut tx, rms).await.unwrap();
        storage
            .senders()
            .insert(&mut tx, SenderRecord::application("client-1", "s-1", "http://peer", n, "p-out", then))
            .await
            .unwrap();
        storage
            .properties()
            .insert(&mut tx, SequenceProperty::new("client-1", "rm_version", "1.1"))
            .await
            .unwrap();

        storage
            .rmd()
            .insert(&mut tx, RmdRecord::new("in-1", "http://acks", true, then))
            .await
            .unwrap();
        storage
            .invokers()
            .insert(&mut tx, InvokerRecord::new("p-in", "in-1", 1, then))
            .await
            .unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let (storage, _, housekeeper) = housekeeper(RmPolicy::default());
        let then = Utc::now() - ChronoDuration::days(30);
        seed(&storage, then).await;
        assert!(housekeeper.run_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactivity_times_out_both_sides() {
        let policy = RmPolicy::default().with_inactivity_timeout(Some(Duration::from_secs(60)));
        let (storage, faults, housekeeper) = housekeeper(policy);
        let then = Utc::now();
        seed(&storage, then).await;

        let early = housekeeper.run_once_at(then + ChronoDuration::seconds(30)).await.unwrap();
        assert!(early.is_empty());

        let late = housekeeper.run_once_at(then + ChronoDuration::seconds(90)).await.unwrap();
        assert_eq!(late.timed_out_outbound, vec!["client-1".to_string()]);
        assert_eq!(late.terminated_inbound, vec!["in-1".to_string()]);
        assert!(matches!(
            faults.faults().as_slice(),
            [EngineFault::InactivityTimeout { idle_ms: 90_000, .. }]
        ));

        let snapshot = storage.snapshot();
        assert!(snapshot.rms[0].timed_out);
        assert!(!snapshot.senders[0].send);
        assert!(snapshot.rmd[0].is_terminated());
    }

    #[tokio::test]
    async fn test_removal_waits_for_pending_invocations() {
        let policy = RmPolicy::default()
            .with_inactivity_timeout(Some(Duration::from_secs(60)))
            .with_sequence_removal_timeout(Some(Duration::from_secs(60)));
        let (storage, _, housekeeper) = housekeeper(policy);
        let then = Utc::now();
        seed(&storage, then).await;

        housekeeper.run_once_at(then + ChronoDuration::seconds(90)).await.unwrap();
        let report = housekeeper.run_once_at(then + ChronoDuration::seconds(200)).await.unwrap();
        assert_eq!(report.removed_outbound, vec!["client-1".to_string()]);
        assert!(report.removed_inbound.is_empty());

        let snapshot = storage.snapshot();
        assert!(snapshot.rms.is_empty());
        assert!(snapshot.properties.is_empty());
        assert!(snapshot.senders.is_empty());
        assert_eq!(snapshot.rmd.len(), 1);

        let mut tx = storage.begin();
        let mut record = storage.invokers().retrieve(&mut tx, "p-in").await.unwrap().unwrap();
        record.invoked = true;
        storage.invokers().update(&mut tx, record).await.unwrap();
        tx.commit().unwrap();

        let report = housekeeper.run_once_at(then + ChronoDuration::seconds(300)).await.unwrap();
        assert_eq!(report.removed_inbound, vec!["in-1".to_string()]);
        let snapshot = storage.snapshot();
        assert!(snapshot.rmd.is_empty());
        assert!(snapshot.invokers.is_empty());
    }
}
