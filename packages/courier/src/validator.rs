//! Inbound message validation.
//!
//! Two checks run before an inbound message changes any state:
//!
//! - [`validate_versions`] compares the declared protocol and addressing
//!   versions with those recorded for the sequence. The first message of a
//!   sequence records them. All comparisons run before any write, so a
//!   mismatch leaves the store untouched.
//! - [`validate_application_message`] checks a message number against the
//!   receiver record: unknown and terminated sequences, numbers past the
//!   declared last message, rollover, and new messages on closed sequences.

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, FaultCode, InternalFault, Result, RmFault};
use crate::records::{property_names, RmdRecord, SequenceProperty, SequenceState, MAX_MESSAGE_NUMBER};
use crate::storage::{StorageManager, Transaction};

/// Versions an inbound message declares. `None` means not declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersions {
    pub rm_version: Option<String>,
    pub addressing_version: Option<String>,
}

impl ProtocolVersions {
    pub fn new(rm_version: impl Into<String>, addressing_version: impl Into<String>) -> Self {
        Self {
            rm_version: Some(rm_version.into()),
            addressing_version: Some(addressing_version.into()),
        }
    }

    fn declared(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        [
            (property_names::RM_VERSION, self.rm_version.as_deref()),
            (property_names::ADDRESSING_VERSION, self.addressing_version.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

/// Check `versions` against the properties recorded for `sequence_key`,
/// recording any that are new.
pub async fn validate_versions(
    storage: &dyn StorageManager,
    tx: &mut Transaction,
    sequence_key: &str,
    versions: &ProtocolVersions,
) -> Result<()> {
    let mut missing = Vec::new();

    for (name, actual) in versions.declared() {
        let key = SequenceProperty::key_for(sequence_key, name);
        match storage.properties().retrieve(tx, &key).await? {
            Some(recorded) if recorded.value != actual => {
                return Err(InternalFault::VersionMismatch {
                    sequence_key: sequence_key.to_string(),
                    property: name.to_string(),
                    expected: recorded.value,
                    actual: actual.to_string(),
                }
                .into());
            }
            Some(_) => {}
            None => missing.push(SequenceProperty::new(sequence_key, name, actual)),
        }
    }

    for property in missing {
        storage.properties().insert(tx, property).await?;
    }
    Ok(())
}

/// Check that message `n` may be accepted on the sequence described by
/// `rmd`, returning the record on success.
pub fn validate_application_message(
    sequence_id: &str,
    rmd: Option<RmdRecord>,
    n: u64,
) -> Result<RmdRecord> {
    let Some(rmd) = rmd else {
        return Err(RmFault::unknown_sequence(sequence_id).into());
    };
    if n == 0 {
        return Err(InternalFault::InvalidMessageNumber(n).into());
    }
    if n > MAX_MESSAGE_NUMBER {
        return Err(fault(
            FaultCode::MessageNumberRollover,
            sequence_id,
            format!("message number {n} exceeds {MAX_MESSAGE_NUMBER}"),
        ));
    }
    if rmd.is_terminated() {
        return Err(RmFault::terminated(sequence_id).into());
    }
    // Redeliveries of received numbers still pass so they can be acked.
    if rmd.state == SequenceState::Closing && !rmd.completed.contains(n) {
        return Err(fault(
            FaultCode::SequenceClosed,
            sequence_id,
            "the sequence is closed to new messages",
        ));
    }
    if let Some(last) = rmd.last_message_number {
        if n > last {
            return Err(fault(
                FaultCode::LastMessageNumberExceeded,
                sequence_id,
                format!("message number {n} is above the last message number {last}"),
            ));
        }
    }
    Ok(rmd)
}

fn fault(code: FaultCode, sequence_id: &str, detail: impl Into<String>) -> CourierError {
    RmFault::new(code, sequence_id, detail).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PropertyFinder;
    use crate::storage::InMemoryStorageManager;
    use chrono::Utc;

    fn rmd() -> RmdRecord {
        RmdRecord::new("s-1", "http://acks", true, Utc::now())
    }

    fn code(err: CourierError) -> Option<FaultCode> {
        err.as_fault().map(|f| f.code)
    }

    #[tokio::test]
    async fn test_first_message_records_versions() {
        let storage = InMemoryStorageManager::default();
        let versions = ProtocolVersions::new("rm-1.1", "wsa-2005");

        let mut tx = storage.begin();
        validate_versions(&storage, &mut tx, "s-1", &versions).await.unwrap();
        validate_versions(&storage, &mut tx, "s-1", &versions).await.unwrap();
        let props = storage
            .properties()
            .find(&mut tx, &PropertyFinder::default())
            .await
            .unwrap();
        assert_eq!(props.len(), 2);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_fails_without_writing() {
        let storage = InMemoryStorageManager::default();
        let mut tx = storage.begin();
        validate_versions(
            &storage,
            &mut tx,
            "s-1",
            &ProtocolVersions {
                rm_version: None,
                addressing_version: Some("wsa-2005".into()),
            },
        )
        .await
        .unwrap();
        tx.commit().unwrap();

        // New rm_version, conflicting addressing_version.
        let mut tx = storage.begin();
        let err = validate_versions(
            &storage,
            &mut tx,
            "s-1",
            &ProtocolVersions::new("rm-1.1", "wsa-2004"),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CourierError::Internal(InternalFault::VersionMismatch { .. })
        ));
        let props = storage
            .properties()
            .find(&mut tx, &PropertyFinder::default())
            .await
            .unwrap();
        assert_eq!(props.len(), 1);
        tx.commit().unwrap();
    }

    #[test]
    fn test_sequence_checks() {
        assert_eq!(
            code(validate_application_message("nope", None, 1).unwrap_err()),
            Some(FaultCode::UnknownSequence)
        );
        assert!(matches!(
            validate_application_message("s-1", Some(rmd()), 0),
            Err(CourierError::Internal(InternalFault::InvalidMessageNumber(0)))
        ));
        assert_eq!(
            code(validate_application_message("s-1", Some(rmd()), MAX_MESSAGE_NUMBER + 1).unwrap_err()),
            Some(FaultCode::MessageNumberRollover)
        );

        let mut terminated = rmd();
        terminated.state = SequenceState::Terminated;
        assert_eq!(
            code(validate_application_message("s-1", Some(terminated), 1).unwrap_err()),
            Some(FaultCode::SequenceTerminated)
        );

        let mut bounded = rmd();
        bounded.last_message_number = Some(3);
        assert!(validate_application_message("s-1", Some(bounded.clone()), 3).is_ok());
        assert_eq!(
            code(validate_application_message("s-1", Some(bounded), 4).unwrap_err()),
            Some(FaultCode::LastMessageNumberExceeded)
        );
    }

    #[test]
    fn test_closed_sequence_refuses_new_numbers_only() {
        let mut closing = rmd();
        closing.state = SequenceState::Closing;
        closing.completed.insert(1);
        closing.completed.insert(3);
        closing.last_message_number = Some(3);
        assert_eq!(
            code(validate_application_message("s-1", Some(closing.clone()), 4).unwrap_err()),
            Some(FaultCode::SequenceClosed)
        );
        assert!(validate_application_message("s-1", Some(closing.clone()), 1).is_ok());
        assert_eq!(
            code(validate_application_message("s-1", Some(closing), 2).unwrap_err()),
            Some(FaultCode::SequenceClosed)
        );
    }
}
