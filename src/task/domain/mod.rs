//! Domain model for relay tasks.
//!
//! A task is one inbound event travelling through download, prepare and
//! publish. Status changes are resolved here into [`StageTransition`] values
//! so every store applies the same rules, and retry timing comes from
//! [`RetryPolicy`]. Nothing in this module touches infrastructure.

mod delivery;
mod error;
mod event;
mod ids;
mod retry;
mod stage;
mod task;

pub use delivery::{Delivery, DeliveryStatus, PersistedDeliveryData};
pub use error::{
    ParseDeliveryStatusError, ParseTaskKindError, ParseTaskStatusError, TaskDomainError,
};
pub use event::{MediaKind, NormalizedEvent};
pub use ids::{CorrelationKey, DeliveryId, DeliveryTarget, TaskId};
pub use retry::{
    DEFAULT_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS, MAX_BACKOFF_SECS, RetryDecision, RetryPolicy,
    RetryPolicyError,
};
pub use stage::{FailureClass, Stage, StageArtifact, StageFailure, StageOutcome};
pub use task::{
    ClaimedTask, ErrorUpdate, INTERRUPTED_FINAL_ATTEMPT, NewTask, PayloadRef, PersistedTaskData,
    RESUMABLE_STATUSES, StageTransition, Task, TaskKind, TaskStatus,
};
