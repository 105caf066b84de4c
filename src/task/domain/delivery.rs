//! Per-target delivery records guarding publish and side-effect calls.

use super::{DeliveryId, DeliveryTarget, ParseDeliveryStatusError, RetryDecision, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery progress for one `(target, task)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not attempted yet.
    Pending,
    /// An attempt is in flight.
    Sending,
    /// Delivered. Terminal.
    Posted,
    /// Last attempt failed.
    Failed,
}

impl DeliveryStatus {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Posted => "posted",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for DeliveryStatus {
    type Error = ParseDeliveryStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "posted" => Ok(Self::Posted),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseDeliveryStatusError(value.to_owned())),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    id: DeliveryId,
    task_id: TaskId,
    target: DeliveryTarget,
    status: DeliveryStatus,
    attempts: u32,
    external_id: Option<String>,
    error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Parameter object for reconstructing a persisted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDeliveryData {
    /// Persisted delivery identifier.
    pub id: DeliveryId,
    /// Owning task.
    pub task_id: TaskId,
    /// Destination name.
    pub target: DeliveryTarget,
    /// Persisted status.
    pub status: DeliveryStatus,
    /// Persisted attempt count.
    pub attempts: u32,
    /// Identifier returned by the target.
    pub external_id: Option<String>,
    /// Last failure message.
    pub error: Option<String>,
    /// Earliest retry time.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Latest update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery.
    #[must_use]
    pub fn new(task_id: TaskId, target: DeliveryTarget, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            task_id,
            target,
            status: DeliveryStatus::Pending,
            attempts: 0,
            external_id: None,
            error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstructs a delivery from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedDeliveryData) -> Self {
        Self {
            id: data.id,
            task_id: data.task_id,
            target: data.target,
            status: data.status,
            attempts: data.attempts,
            external_id: data.external_id,
            error: data.error,
            next_attempt_at: data.next_attempt_at,
            created_at: data.created_at,
            updated_at: data.updated_at,
        }
    }

    /// Returns the delivery identifier.
    #[must_use]
    pub const fn id(&self) -> DeliveryId {
        self.id
    }

    /// Returns the owning task.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the destination name.
    #[must_use]
    pub const fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Returns the number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the identifier the target assigned.
    #[must_use]
    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    /// Returns the last failure message.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the earliest retry time.
    #[must_use]
    pub const fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the latest update timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` if an attempt may start at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
            && self.attempts < max_attempts
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Marks an attempt as in flight and counts it.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Sending;
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt_at = None;
        self.touch(now);
    }

    /// Records a successful delivery.
    pub fn mark_posted(&mut self, external_id: Option<String>, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Posted;
        self.external_id = external_id;
        self.error = None;
        self.next_attempt_at = None;
        self.touch(now);
    }

    /// Records a failed attempt.
    ///
    /// A terminal decision raises `attempts` to `max_attempts` so the
    /// delivery is never claimed again.
    pub fn mark_failed(
        &mut self,
        message: impl Into<String>,
        decision: RetryDecision,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) {
        self.status = DeliveryStatus::Failed;
        self.error = Some(message.into());
        self.next_attempt_at = decision.retry_at();
        if decision.is_terminal() {
            self.attempts = self.attempts.max(max_attempts);
        }
        self.touch(now);
    }

    /// Returns an interrupted in-flight attempt to the retry queue.
    pub fn release_interrupted(&mut self, now: DateTime<Utc>) {
        if self.status == DeliveryStatus::Sending {
            self.status = DeliveryStatus::Failed;
            self.error = Some("interrupted".to_owned());
            self.next_attempt_at = None;
            self.touch(now);
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
