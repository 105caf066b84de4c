//! Error types for task domain validation, parsing and transitions.

use super::{Stage, TaskId, TaskStatus};
use thiserror::Error;

/// Errors returned while constructing or mutating domain task values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskDomainError {
    /// A media event carried neither a remote identifier nor a URL.
    #[error("media payload requires a remote identifier or a URL")]
    EmptyMediaPayload,

    /// A text event carried no text after trimming.
    #[error("text payload must not be empty")]
    EmptyTextPayload,

    /// The delivery target name is empty or contains whitespace.
    #[error("invalid delivery target '{0}'")]
    InvalidDeliveryTarget(String),

    /// The correlation key is empty after trimming.
    #[error("correlation key must not be empty")]
    EmptyCorrelationKey,

    /// The event could not be canonicalised for hashing.
    #[error("failed to canonicalise event: {0}")]
    Canonicalisation(String),

    /// A transition was resolved against a different task.
    #[error("transition for task {expected} applied to task {actual}")]
    TaskMismatch {
        /// Task the transition was resolved for.
        expected: TaskId,
        /// Task the transition was applied to.
        actual: TaskId,
    },

    /// The stored status no longer matches the status the transition expects.
    #[error("task {task_id} is {actual}, transition expected {expected}")]
    StaleTransition {
        /// Task identifier.
        task_id: TaskId,
        /// Status the transition was resolved from.
        expected: TaskStatus,
        /// Status found at apply time.
        actual: TaskStatus,
    },

    /// The state machine does not permit the requested transition.
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task identifier.
        task_id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// A set-once artifact would be overwritten with a different value.
    #[error("task {task_id} already has a different {artifact}")]
    ArtifactAlreadySet {
        /// Task identifier.
        task_id: TaskId,
        /// Artifact column name.
        artifact: &'static str,
    },

    /// A stage completed with an artifact that belongs to another stage.
    #[error("stage {stage} cannot produce artifact {artifact}")]
    ArtifactStageMismatch {
        /// Stage that completed.
        stage: Stage,
        /// Artifact column name.
        artifact: &'static str,
    },
}

/// Error returned while parsing task statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown task status: {0}")]
pub struct ParseTaskStatusError(pub String);

/// Error returned while parsing task kinds from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown task kind: {0}")]
pub struct ParseTaskKindError(pub String);

/// Error returned while parsing delivery statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown delivery status: {0}")]
pub struct ParseDeliveryStatusError(pub String);
