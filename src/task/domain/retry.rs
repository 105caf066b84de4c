//! Backoff schedule and retry decisions.

use super::FailureClass;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// Default backoff table, in seconds.
pub const DEFAULT_BACKOFF_SECS: [u64; 7] = [60, 300, 900, 3_600, 7_200, 14_400, 28_800];

/// Default maximum number of attempts per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Longest accepted backoff entry, in seconds (one year).
pub const MAX_BACKOFF_SECS: u64 = 366 * 24 * 3_600;

/// Errors raised when building a [`RetryPolicy`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryPolicyError {
    /// The backoff table has no entries.
    #[error("backoff table must not be empty")]
    EmptyBackoff,

    /// A backoff entry is zero or longer than [`MAX_BACKOFF_SECS`].
    #[error("backoff entry {0}s is out of range")]
    InvalidDelay(u64),

    /// A backoff entry is shorter than the one before it.
    #[error("backoff table must be non-decreasing")]
    DescendingBackoff,

    /// `max_attempts` is zero.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry no earlier than the given instant.
    RetryAt(DateTime<Utc>),
    /// The attempt budget is spent.
    Exhausted,
    /// The failure cannot succeed on retry.
    Permanent,
}

impl RetryDecision {
    /// Returns `true` when no further attempt will be made.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::RetryAt(_))
    }

    /// Returns the scheduled retry time, if any.
    #[must_use]
    pub const fn retry_at(self) -> Option<DateTime<Utc>> {
        match self {
            Self::RetryAt(at) => Some(at),
            Self::Exhausted | Self::Permanent => None,
        }
    }
}

/// Backoff table plus attempt ceiling.
///
/// The delay after the `k`-th failed attempt is the `k`-th table entry, or
/// the last entry once `k` runs past the table. Delays are persisted as
/// `next_attempt_at` and never slept on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<TimeDelta>,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Builds a policy from a table of delays in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] when the table is empty, has a zero,
    /// oversized or descending entry, or `max_attempts` is zero.
    pub fn from_secs(backoff_secs: &[u64], max_attempts: u32) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if backoff_secs.is_empty() {
            return Err(RetryPolicyError::EmptyBackoff);
        }
        if backoff_secs.windows(2).any(|pair| matches!(pair, [a, b] if b < a)) {
            return Err(RetryPolicyError::DescendingBackoff);
        }
        let backoff = backoff_secs
            .iter()
            .map(|&secs| {
                Some(secs)
                    .filter(|value| (1..=MAX_BACKOFF_SECS).contains(value))
                    .and_then(|value| i64::try_from(value).ok())
                    .and_then(TimeDelta::try_seconds)
                    .ok_or(RetryPolicyError::InvalidDelay(secs))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            backoff,
            max_attempts,
        })
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay to wait after the given 1-based failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> TimeDelta {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    /// Decides what follows a failed attempt.
    ///
    /// A retry time that cannot be represented counts as exhausted.
    #[must_use]
    pub fn decide(&self, attempt: u32, class: FailureClass, now: DateTime<Utc>) -> RetryDecision {
        match class {
            FailureClass::Permanent => RetryDecision::Permanent,
            FailureClass::Transient if attempt >= self.max_attempts => RetryDecision::Exhausted,
            FailureClass::Transient => now
                .checked_add_signed(self.delay_for(attempt))
                .map_or(RetryDecision::Exhausted, RetryDecision::RetryAt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .filter_map(|&secs| i64::try_from(secs).ok().and_then(TimeDelta::try_seconds))
                .collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
