//! Reliable-messaging policy.
//!
//! [`RmPolicy`] holds the timing and delivery knobs shared by the sender,
//! invoker and housekeeping loops. Defaults follow the usual WS-RM
//! deployment values: retransmit every 6s with exponential backoff, give up
//! after 8 attempts, acknowledge within 3s, deliver in order.
//!
//! # Environment
//!
//! [`RmPolicy::from_env`] reads the following variables (after loading a
//! `.env` file if present). Durations are milliseconds; a value of zero or
//! less disables the optional timeouts.
//!
//! | Variable | Field |
//! |---|---|
//! | `COURIER_RETRANSMISSION_INTERVAL_MS` | `retransmission_interval` |
//! | `COURIER_ACKNOWLEDGEMENT_INTERVAL_MS` | `acknowledgement_interval` |
//! | `COURIER_EXPONENTIAL_BACKOFF` | `exponential_backoff` |
//! | `COURIER_MAX_RETRANSMISSIONS` | `max_retransmissions` |
//! | `COURIER_INACTIVITY_TIMEOUT_MS` | `inactivity_timeout` |
//! | `COURIER_SEQUENCE_REMOVAL_TIMEOUT_MS` | `sequence_removal_timeout` |
//! | `COURIER_INVOKE_IN_ORDER` | `invoke_in_order` |
//! | `COURIER_LOCK_TIMEOUT_MS` | `lock_timeout` |
//! | `COURIER_SENDER_POLL_INTERVAL_MS` | `sender_poll_interval` |
//! | `COURIER_INVOKER_POLL_INTERVAL_MS` | `invoker_poll_interval` |
//! | `COURIER_HOUSEKEEPING_INTERVAL_MS` | `housekeeping_interval` |

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use dotenvy::dotenv;
use thiserror::Error;

/// Hard ceiling on transmission attempts per message.
pub const MAX_RETRANSMISSION_CEILING: u32 = 10;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_retransmissions is {0}, above the ceiling of {MAX_RETRANSMISSION_CEILING}")]
    RetransmissionCeiling(u32),

    #[error("max_retransmissions must be at least 1")]
    NoTransmissions,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// A required collaborator was not supplied to the engine builder.
    #[error("no {0} was configured")]
    Missing(&'static str),
}

/// Delivery and retransmission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmPolicy {
    /// Base delay between transmissions of an unacknowledged message.
    pub retransmission_interval: Duration,
    /// How long a receiver may hold back an acknowledgement.
    pub acknowledgement_interval: Duration,
    /// Double the delay after every attempt instead of keeping it constant.
    pub exponential_backoff: bool,
    /// Transmission attempts per message before the sequence times out.
    pub max_retransmissions: u32,
    /// Idle time after which a sequence is given up. `None` disables.
    pub inactivity_timeout: Option<Duration>,
    /// Idle time after which a finished sequence is deleted. `None` disables.
    pub sequence_removal_timeout: Option<Duration>,
    /// Whether new inbound sequences deliver strictly in order.
    pub invoke_in_order: bool,
    /// Bound on waiting for a record lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    pub sender_poll_interval: Duration,
    pub invoker_poll_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for RmPolicy {
    fn default() -> Self {
        Self {
            retransmission_interval: Duration::from_millis(6000),
            acknowledgement_interval: Duration::from_millis(3000),
            exponential_backoff: true,
            max_retransmissions: 8,
            inactivity_timeout: None,
            sequence_removal_timeout: None,
            invoke_in_order: true,
            lock_timeout: Some(Duration::from_secs(30)),
            sender_poll_interval: Duration::from_millis(500),
            invoker_poll_interval: Duration::from_millis(1000),
            housekeeping_interval: Duration::from_millis(20_000),
        }
    }
}

impl RmPolicy {
    pub fn with_retransmission_interval(mut self, interval: Duration) -> Self {
        self.retransmission_interval = interval;
        self
    }

    pub fn with_acknowledgement_interval(mut self, interval: Duration) -> Self {
        self.acknowledgement_interval = interval;
        self
    }

    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn with_max_retransmissions(mut self, attempts: u32) -> Self {
        self.max_retransmissions = attempts;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_sequence_removal_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sequence_removal_timeout = timeout;
        self
    }

    pub fn with_invoke_in_order(mut self, in_order: bool) -> Self {
        self.invoke_in_order = in_order;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the sender, invoker and housekeeping poll intervals at once.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.sender_poll_interval = interval;
        self.invoker_poll_interval = interval;
        self.housekeeping_interval = interval;
        self
    }

    /// Check the policy for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retransmissions == 0 {
            return Err(ConfigError::NoTransmissions);
        }
        if self.max_retransmissions > MAX_RETRANSMISSION_CEILING {
            return Err(ConfigError::RetransmissionCeiling(self.max_retransmissions));
        }
        for (name, interval) in [
            ("sender_poll_interval", self.sender_poll_interval),
            ("invoker_poll_interval", self.invoker_poll_interval),
            ("housekeeping_interval", self.housekeeping_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    /// Attempts allowed per message, clamped to the hard ceiling.
    pub fn attempt_ceiling(&self) -> u32 {
        self.max_retransmissions.clamp(1, MAX_RETRANSMISSION_CEILING)
    }

    /// Delay before the next attempt, given how many attempts were made.
    ///
    /// With backoff enabled this is `interval * 2^(sent_count - 1)`.
    pub fn retransmission_delay(&self, sent_count: u32) -> Duration {
        if !self.exponential_backoff || sent_count <= 1 {
            return self.retransmission_interval;
        }
        let factor = 1u32 << (sent_count - 1).min(16);
        self.retransmission_interval.saturating_mul(factor)
    }

    /// Load the policy from `COURIER_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let millis = |name: &str| -> Result<Option<i64>> {
            lookup(name)
                .map(|v| {
                    v.trim()
                        .parse::<i64>()
                        .with_context(|| format!("{name} must be a number of milliseconds"))
                })
                .transpose()
        };
        let required = |name: &str, default: Duration| -> Result<Duration> {
            Ok(millis(name)?
                .map(|ms| Duration::from_millis(ms.max(0) as u64))
                .unwrap_or(default))
        };
        let optional = |name: &str, default: Option<Duration>| -> Result<Option<Duration>> {
            Ok(match millis(name)? {
                Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
                Some(_) => None,
                None => default,
            })
        };
        let flag = |name: &str, default: bool| -> Result<bool> {
            lookup(name)
                .map(|v| {
                    v.trim()
                        .parse::<bool>()
                        .with_context(|| format!("{name} must be true or false"))
                })
                .transpose()
                .map(|v| v.unwrap_or(default))
        };

        let policy = Self {
            retransmission_interval: required(
                "COURIER_RETRANSMISSION_INTERVAL_MS",
                defaults.retransmission_interval,
            )?,
            acknowledgement_interval: required(
                "COURIER_ACKNOWLEDGEMENT_INTERVAL_MS",
                defaults.acknowledgement_interval,
            )?,
            exponential_backoff: flag("COURIER_EXPONENTIAL_BACKOFF", defaults.exponential_backoff)?,
            max_retransmissions: lookup("COURIER_MAX_RETRANSMISSIONS")
                .map(|v| {
                    v.trim()
                        .parse::<u32>()
                        .context("COURIER_MAX_RETRANSMISSIONS must be a valid number")
                })
                .transpose()?
                .unwrap_or(defaults.max_retransmissions),
            inactivity_timeout: optional(
                "COURIER_INACTIVITY_TIMEOUT_MS",
                defaults.inactivity_timeout,
            )?,
            sequence_removal_timeout: optional(
                "COURIER_SEQUENCE_REMOVAL_TIMEOUT_MS",
                defaults.sequence_removal_timeout,
            )?,
            invoke_in_order: flag("COURIER_INVOKE_IN_ORDER", defaults.invoke_in_order)?,
            lock_timeout: optional("COURIER_LOCK_TIMEOUT_MS", defaults.lock_timeout)?,
            sender_poll_interval: required(
                "COURIER_SENDER_POLL_INTERVAL_MS",
                defaults.sender_poll_interval,
            )?,
            invoker_poll_interval: required(
                "COURIER_INVOKER_POLL_INTERVAL_MS",
                defaults.invoker_poll_interval,
            )?,
            housekeeping_interval: required(
                "COURIER_HOUSEKEEPING_INTERVAL_MS",
                defaults.housekeeping_interval,
            )?,
        };

        policy.validate().context("invalid courier policy")?;
        Ok(policy)
    }
}

/// `now` plus a std duration, saturating at the latest representable time.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How long ago `then` was, zero if it is in the future.
pub(crate) fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let policy = RmPolicy::default();
        assert_eq!(policy.retransmission_interval, Duration::from_millis(6000));
        assert_eq!(policy.acknowledgement_interval, Duration::from_millis(3000));
        assert!(policy.exponential_backoff);
        assert_eq!(policy.max_retransmissions, 8);
        assert_eq!(policy.inactivity_timeout, None);
        assert!(policy.invoke_in_order);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RmPolicy::default().with_retransmission_interval(Duration::from_millis(100));
        assert_eq!(policy.retransmission_delay(1), Duration::from_millis(100));
        assert_eq!(policy.retransmission_delay(2), Duration::from_millis(200));
        assert_eq!(policy.retransmission_delay(4), Duration::from_millis(800));

        let constant = policy.with_exponential_backoff(false);
        assert_eq!(constant.retransmission_delay(4), Duration::from_millis(100));
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let policy = RmPolicy::default().with_max_retransmissions(12);
        assert_eq!(
            policy.validate(),
            Err(ConfigError::RetransmissionCeiling(12))
        );
        assert_eq!(policy.attempt_ceiling(), MAX_RETRANSMISSION_CEILING);
        assert_eq!(
            RmPolicy::default().with_max_retransmissions(0).validate(),
            Err(ConfigError::NoTransmissions)
        );
    }

    #[test]
    fn test_from_lookup_overrides_and_disables() {
        let policy = RmPolicy::from_lookup(lookup(&[
            ("COURIER_RETRANSMISSION_INTERVAL_MS", "250"),
            ("COURIER_EXPONENTIAL_BACKOFF", "false"),
            ("COURIER_MAX_RETRANSMISSIONS", "3"),
            ("COURIER_INACTIVITY_TIMEOUT_MS", "60000"),
            ("COURIER_LOCK_TIMEOUT_MS", "-1"),
            ("COURIER_INVOKE_IN_ORDER", "false"),
        ]))
        .unwrap();

        assert_eq!(policy.retransmission_interval, Duration::from_millis(250));
        assert!(!policy.exponential_backoff);
        assert_eq!(policy.max_retransmissions, 3);
        assert_eq!(policy.inactivity_timeout, Some(Duration::from_secs(60)));
        assert_eq!(policy.lock_timeout, None);
        assert!(!policy.invoke_in_order);
        assert_eq!(policy.acknowledgement_interval, Duration::from_millis(3000));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(RmPolicy::from_lookup(lookup(&[("COURIER_ACKNOWLEDGEMENT_INTERVAL_MS", "soon")])).is_err());
        assert!(RmPolicy::from_lookup(lookup(&[("COURIER_MAX_RETRANSMISSIONS", "11")])).is_err());
    }
}
