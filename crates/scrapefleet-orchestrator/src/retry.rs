//! Retry policy for failed scrape attempts.

use serde::Deserialize;
use std::time::Duration;

use crate::classify::ErrorKind;

/// Retry policy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Global attempt ceiling across all error kinds.
    pub max_attempts: u32,
    /// Attempt ceiling for parse errors. Layout breakage rarely
    /// self-resolves, so this is far lower than the global ceiling.
    pub parse_error_max_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "crate::config::serde_duration_secs")]
    pub base_delay: Duration,
    /// Cap for exponential backoff.
    #[serde(with = "crate::config::serde_duration_secs")]
    pub max_delay: Duration,
    /// Fixed delay for transient failures (network, timeout).
    #[serde(with = "crate::config::serde_duration_secs")]
    pub transient_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            parse_error_max_attempts: 2,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(900),
            transient_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the task after the delay.
    Retry {
        /// How long the task is ineligible for dispatch.
        delay: Duration,
        /// Whether the next attempt must use a different egress identity.
        rotate_egress: bool,
    },
    /// Mark the task permanently failed.
    GiveUp,
}

/// Retry policy.
///
/// Given the classified error kind and how many attempts the task has
/// consumed, decides whether to retry, how long to wait, and whether the
/// next attempt needs a fresh outbound network path.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from configuration.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decides the fate of a task after a failed attempt.
    ///
    /// `attempt_count` is the number of attempts already consumed,
    /// including the one that just failed.
    #[must_use]
    pub fn decide(&self, kind: ErrorKind, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }

        match kind {
            // The current identity/address is compromised: back off hard
            // and force a different egress on the next attempt.
            ErrorKind::Captcha | ErrorKind::Blocked => RetryDecision::Retry {
                delay: self.backoff_delay(attempt_count),
                rotate_egress: true,
            },
            // A politeness delay is sufficient; no rotation needed.
            ErrorKind::Throttled => RetryDecision::Retry {
                delay: self.backoff_delay(attempt_count),
                rotate_egress: false,
            },
            ErrorKind::Network | ErrorKind::Timeout => RetryDecision::Retry {
                delay: self.config.transient_delay,
                rotate_egress: false,
            },
            ErrorKind::ParseError => {
                if attempt_count >= self.config.parse_error_max_attempts {
                    RetryDecision::GiveUp
                } else {
                    // Layout may be a one-off anomaly; retry exactly once.
                    RetryDecision::Retry {
                        delay: self.config.transient_delay,
                        rotate_egress: false,
                    }
                }
            }
        }
    }

    /// Calculates the exponential backoff delay for an attempt.
    ///
    /// The first retry waits `base_delay`; each further retry doubles it
    /// (base_delay * 2^(attempt - 1)), capped at max_delay. Attempt counts
    /// start at 1 since a failure is only ever reported for a claimed
    /// dispatch.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.config.base_delay.saturating_mul(multiplier.min(u64::from(u32::MAX)) as u32);
        delay.min(self.config.max_delay)
    }
}
