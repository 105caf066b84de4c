//! Task aggregate root, its status machine and resolved transitions.

use super::{
    CorrelationKey, FailureClass, ParseTaskKindError, ParseTaskStatusError, RetryDecision,
    RetryPolicy, Stage, StageArtifact, StageOutcome, TaskDomainError, TaskId,
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last error recorded when a task is interrupted on its final attempt.
pub const INTERRUPTED_FINAL_ATTEMPT: &str = "interrupted after final attempt";

/// Task processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker, no stage started yet.
    Claimed,
    /// Source media is being fetched.
    Downloading,
    /// Source media is stored locally.
    Downloaded,
    /// Source media is being transformed.
    Preparing,
    /// Prepared media is ready to publish.
    Prepared,
    /// Published. Terminal.
    Posted,
    /// Last attempt failed; retryable until the attempt budget is spent.
    Failed,
}

/// Statuses a crashed process may leave behind.
pub const RESUMABLE_STATUSES: [TaskStatus; 5] = [
    TaskStatus::Claimed,
    TaskStatus::Downloading,
    TaskStatus::Downloaded,
    TaskStatus::Preparing,
    TaskStatus::Prepared,
];

impl TaskStatus {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Posted => "posted",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` while a worker owns the task.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Claimed | Self::Downloading | Self::Downloaded | Self::Preparing | Self::Prepared
        )
    }

    /// Returns `true` for statuses the dispatcher may claim from.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }

    /// Returns `true` if the state machine permits moving to `target`.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::Queued | Self::Failed, Self::Claimed)
            | (Self::Claimed, Self::Downloading | Self::Preparing)
            | (Self::Downloading, Self::Downloaded)
            | (Self::Downloaded, Self::Preparing)
            | (Self::Preparing, Self::Prepared) => true,
            (from, Self::Queued | Self::Failed | Self::Posted) => from.is_in_progress(),
            _ => false,
        }
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = ParseTaskStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "preparing" => Ok(Self::Preparing),
            "prepared" => Ok(Self::Prepared),
            "posted" => Ok(Self::Posted),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseTaskStatusError(value.to_owned())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content a task relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Still image.
    Photo,
    /// Video clip.
    Video,
    /// Plain text.
    Text,
}

impl TaskKind {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Text => "text",
        }
    }
}

impl TryFrom<&str> for TaskKind {
    type Error = ParseTaskKindError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "photo" => Ok(Self::Photo),
            "video" => Ok(Self::Video),
            "text" => Ok(Self::Text),
            _ => Err(ParseTaskKindError(value.to_owned())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the task's source content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Media hosted by the source.
    Remote {
        /// Remote media identifier.
        remote_id: Option<String>,
        /// Direct media URL.
        url: Option<String>,
    },
    /// Text carried in the event itself.
    Inline {
        /// Post body.
        text: String,
    },
}

impl PayloadRef {
    /// Creates a remote payload reference.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::EmptyMediaPayload`] when neither an
    /// identifier nor a URL is present.
    pub fn remote(remote_id: Option<String>, url: Option<String>) -> Result<Self, TaskDomainError> {
        let remote = remote_id.filter(|id| !id.trim().is_empty());
        let link = url.filter(|value| !value.trim().is_empty());
        if remote.is_none() && link.is_none() {
            return Err(TaskDomainError::EmptyMediaPayload);
        }
        Ok(Self::Remote {
            remote_id: remote,
            url: link,
        })
    }

    /// Creates an inline text payload.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::EmptyTextPayload`] when the text is blank.
    pub fn inline(text: impl Into<String>) -> Result<Self, TaskDomainError> {
        let body = text.into();
        if body.trim().is_empty() {
            return Err(TaskDomainError::EmptyTextPayload);
        }
        Ok(Self::Inline { text: body })
    }
}

/// Insert request for a task that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    correlation_key: CorrelationKey,
    kind: TaskKind,
    payload: PayloadRef,
    caption: Option<String>,
}

impl NewTask {
    /// Creates an insert request.
    #[must_use]
    pub const fn new(correlation_key: CorrelationKey, kind: TaskKind, payload: PayloadRef) -> Self {
        Self {
            correlation_key,
            kind,
            payload,
            caption: None,
        }
    }

    /// Sets the caption passed to the publisher.
    #[must_use]
    pub fn with_caption(mut self, caption: Option<String>) -> Self {
        self.caption = caption;
        self
    }

    /// Returns the deduplication key.
    #[must_use]
    pub const fn correlation_key(&self) -> &CorrelationKey {
        &self.correlation_key
    }
}

/// Task aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    correlation_key: CorrelationKey,
    kind: TaskKind,
    payload: PayloadRef,
    caption: Option<String>,
    status: TaskStatus,
    attempts: u32,
    last_error: Option<String>,
    src_path: Option<Utf8PathBuf>,
    prepared_path: Option<Utf8PathBuf>,
    external_post_id: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Parameter object for reconstructing a persisted task aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTaskData {
    /// Persisted task identifier.
    pub id: TaskId,
    /// Persisted deduplication key.
    pub correlation_key: CorrelationKey,
    /// Persisted task kind.
    pub kind: TaskKind,
    /// Persisted payload reference.
    pub payload: PayloadRef,
    /// Persisted caption.
    pub caption: Option<String>,
    /// Persisted status.
    pub status: TaskStatus,
    /// Persisted attempt count.
    pub attempts: u32,
    /// Persisted last error.
    pub last_error: Option<String>,
    /// Persisted source artifact path.
    pub src_path: Option<Utf8PathBuf>,
    /// Persisted prepared artifact path.
    pub prepared_path: Option<Utf8PathBuf>,
    /// Persisted publisher identifier.
    pub external_post_id: Option<String>,
    /// Persisted earliest retry time.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Persisted creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Persisted latest update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a queued task from an insert request.
    #[must_use]
    pub fn new(request: NewTask, clock: &impl Clock) -> Self {
        let timestamp = clock.utc();
        Self {
            id: TaskId::new(),
            correlation_key: request.correlation_key,
            kind: request.kind,
            payload: request.payload,
            caption: request.caption,
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            src_path: None,
            prepared_path: None,
            external_post_id: None,
            next_attempt_at: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Reconstructs a task from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedTaskData) -> Self {
        Self {
            id: data.id,
            correlation_key: data.correlation_key,
            kind: data.kind,
            payload: data.payload,
            caption: data.caption,
            status: data.status,
            attempts: data.attempts,
            last_error: data.last_error,
            src_path: data.src_path,
            prepared_path: data.prepared_path,
            external_post_id: data.external_post_id,
            next_attempt_at: data.next_attempt_at,
            created_at: data.created_at,
            updated_at: data.updated_at,
        }
    }

    /// Returns the task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the deduplication key.
    #[must_use]
    pub const fn correlation_key(&self) -> &CorrelationKey {
        &self.correlation_key
    }

    /// Returns the task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the payload reference.
    #[must_use]
    pub const fn payload(&self) -> &PayloadRef {
        &self.payload
    }

    /// Returns the caption, if any.
    #[must_use]
    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Returns how many times the task has been claimed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the most recent failure message.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns the stored source artifact path.
    #[must_use]
    pub const fn src_path(&self) -> Option<&Utf8PathBuf> {
        self.src_path.as_ref()
    }

    /// Returns the stored prepared artifact path.
    #[must_use]
    pub const fn prepared_path(&self) -> Option<&Utf8PathBuf> {
        self.prepared_path.as_ref()
    }

    /// Returns the publisher-assigned identifier.
    #[must_use]
    pub fn external_post_id(&self) -> Option<&str> {
        self.external_post_id.as_deref()
    }

    /// Returns the earliest time the task may be claimed again.
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

    /// Returns the first stage whose artifact is missing.
    ///
    /// `None` means every artifact exists and the task only needs to be
    /// marked posted.
    #[must_use]
    pub const fn next_stage(&self) -> Option<Stage> {
        if self.src_path.is_none() {
            Some(Stage::Download)
        } else if self.prepared_path.is_none() {
            Some(Stage::Prepare)
        } else if self.external_post_id.is_none() {
            Some(Stage::Publish)
        } else {
            None
        }
    }

    /// Returns `true` if a dispatcher may claim the task at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status.is_claimable()
            && self.attempts < max_attempts
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Returns `true` once no further processing will happen.
    #[must_use]
    pub const fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            TaskStatus::Posted => true,
            TaskStatus::Failed => self.attempts >= max_attempts,
            _ => false,
        }
    }

    /// Claims the task, counting a new attempt.
    ///
    /// Callers check [`Task::is_claimable`] first; the store performs both
    /// steps inside one exclusive section.
    #[must_use]
    pub fn claim(mut self, now: DateTime<Utc>) -> ClaimedTask {
        let previous_status = self.status;
        self.status = TaskStatus::Claimed;
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt_at = None;
        self.touch(now);
        ClaimedTask {
            task: self,
            previous_status,
        }
    }

    /// Resolves a stage outcome into a transition against this task.
    ///
    /// Returns `Ok(None)` when the outcome needs no status change, which is
    /// the case for starting the publish stage.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::ArtifactStageMismatch`] when a completed
    /// stage reports an artifact that belongs to a different stage.
    pub fn resolve(
        &self,
        stage: Stage,
        outcome: &StageOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<StageTransition>, TaskDomainError> {
        let transition = match outcome {
            StageOutcome::Started => stage
                .started_status()
                .map(|to| StageTransition::new(self, to, now)),
            StageOutcome::Completed(artifact) => {
                if let Some(found) = artifact.as_ref().filter(|found| found.stage() != stage) {
                    return Err(TaskDomainError::ArtifactStageMismatch {
                        stage,
                        artifact: found.column(),
                    });
                }
                Some(
                    StageTransition::new(self, stage.completed_status(), now)
                        .with_artifact(artifact.clone())
                        .with_last_error(ErrorUpdate::Clear),
                )
            }
            StageOutcome::Failed(failure) => {
                let decision = policy.decide(self.attempts, failure.class(), now);
                let message = format!("{stage}: {}", failure.message());
                let mut failed = StageTransition::new(self, TaskStatus::Failed, now)
                    .with_last_error(ErrorUpdate::Set(message));
                failed.next_attempt_at = decision.retry_at();
                if decision == RetryDecision::Permanent {
                    failed.attempts = Some(policy.max_attempts().max(self.attempts));
                }
                Some(failed)
            }
        };
        Ok(transition)
    }

    /// Resolves how startup recovery should settle an interrupted task.
    ///
    /// `published_id` carries an external identifier recorded on the publish
    /// delivery when the task row itself never learned about it. Returns
    /// `None` for tasks that are not in progress.
    #[must_use]
    pub fn resume_transition(
        &self,
        max_attempts: u32,
        published_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        if !self.status.is_in_progress() {
            return None;
        }
        if let Some(posted) = self.posted_transition(published_id, now) {
            return Some(posted);
        }
        if self.attempts >= max_attempts {
            return Some(
                StageTransition::new(self, TaskStatus::Failed, now).with_last_error(
                    ErrorUpdate::Set(INTERRUPTED_FINAL_ATTEMPT.to_owned()),
                ),
            );
        }
        Some(StageTransition::new(self, TaskStatus::Queued, now))
    }

    /// Resolves how to hand back a task whose run stopped on a store error.
    ///
    /// A recorded publish settles the task as posted. Otherwise the attempt
    /// counts as a transient failure: the task is scheduled for a retry
    /// after the policy's delay, or fails terminally once the attempt budget
    /// is spent. Returns `None` for tasks that are not in progress.
    #[must_use]
    pub fn release_transition(
        &self,
        error: &str,
        policy: &RetryPolicy,
        published_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        if !self.status.is_in_progress() {
            return None;
        }
        if let Some(posted) = self.posted_transition(published_id, now) {
            return Some(posted);
        }
        let decision = policy.decide(self.attempts, FailureClass::Transient, now);
        let mut failed = StageTransition::new(self, TaskStatus::Failed, now)
            .with_last_error(ErrorUpdate::Set(error.to_owned()));
        failed.next_attempt_at = decision.retry_at();
        Some(failed)
    }

    fn posted_transition(
        &self,
        published_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        if self.external_post_id.is_some() {
            return Some(
                StageTransition::new(self, TaskStatus::Posted, now)
                    .with_last_error(ErrorUpdate::Clear),
            );
        }
        published_id.map(|external_id| {
            StageTransition::new(self, TaskStatus::Posted, now)
                .with_artifact(Some(StageArtifact::ExternalPost(external_id.to_owned())))
                .with_last_error(ErrorUpdate::Clear)
        })
    }

    /// Applies a resolved transition.
    ///
    /// Nothing is modified unless every check passes.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError`] when the transition targets another task,
    /// was resolved from a status the task no longer has, is not permitted
    /// by the state machine, or would overwrite a set-once artifact.
    pub fn apply(&mut self, transition: &StageTransition) -> Result<(), TaskDomainError> {
        if transition.task_id != self.id {
            return Err(TaskDomainError::TaskMismatch {
                expected: transition.task_id,
                actual: self.id,
            });
        }
        if transition.from != self.status {
            return Err(TaskDomainError::StaleTransition {
                task_id: self.id,
                expected: transition.from,
                actual: self.status,
            });
        }
        if !self.status.can_transition_to(transition.to) {
            return Err(TaskDomainError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: transition.to,
            });
        }
        if let Some(artifact) = &transition.artifact {
            self.check_artifact(artifact)?;
            self.store_artifact(artifact);
        }

        match &transition.last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Clear => self.last_error = None,
            ErrorUpdate::Set(message) => self.last_error = Some(message.clone()),
        }
        if let Some(attempts) = transition.attempts {
            self.attempts = attempts;
        }
        self.next_attempt_at = transition.next_attempt_at;
        self.status = transition.to;
        self.touch(transition.at);
        Ok(())
    }

    fn check_artifact(&self, artifact: &StageArtifact) -> Result<(), TaskDomainError> {
        let conflicts = match artifact {
            StageArtifact::Source(path) => self.src_path.as_ref().is_some_and(|set| set != path),
            StageArtifact::Prepared(path) => {
                self.prepared_path.as_ref().is_some_and(|set| set != path)
            }
            StageArtifact::ExternalPost(id) => {
                self.external_post_id.as_ref().is_some_and(|set| set != id)
            }
        };
        if conflicts {
            return Err(TaskDomainError::ArtifactAlreadySet {
                task_id: self.id,
                artifact: artifact.column(),
            });
        }
        Ok(())
    }

    fn store_artifact(&mut self, artifact: &StageArtifact) {
        match artifact {
            StageArtifact::Source(path) => self.src_path = Some(path.clone()),
            StageArtifact::Prepared(path) => self.prepared_path = Some(path.clone()),
            StageArtifact::ExternalPost(id) => self.external_post_id = Some(id.clone()),
        }
    }

    /// Moves `updated_at` forward, never backwards.
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// A task claimed by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    task: Task,
    previous_status: TaskStatus,
}

impl ClaimedTask {
    /// Returns the claimed task, with the attempt already counted.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Returns the status the task had before the claim.
    #[must_use]
    pub const fn previous_status(&self) -> TaskStatus {
        self.previous_status
    }

    /// Returns the attempt number this claim started.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.task.attempts
    }

    /// Consumes the claim, returning the task.
    #[must_use]
    pub fn into_task(self) -> Task {
        self.task
    }
}

/// How a transition changes `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorUpdate {
    /// Leave the stored error untouched.
    Keep,
    /// Remove the stored error.
    Clear,
    /// Replace the stored error.
    Set(String),
}

/// A fully resolved status change, ready for a store to apply atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransition {
    task_id: TaskId,
    from: TaskStatus,
    to: TaskStatus,
    artifact: Option<StageArtifact>,
    last_error: ErrorUpdate,
    next_attempt_at: Option<DateTime<Utc>>,
    attempts: Option<u32>,
    at: DateTime<Utc>,
}

impl StageTransition {
    fn new(task: &Task, to: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            from: task.status,
            to,
            artifact: None,
            last_error: ErrorUpdate::Keep,
            next_attempt_at: None,
            attempts: None,
            at,
        }
    }

    fn with_artifact(mut self, artifact: Option<StageArtifact>) -> Self {
        self.artifact = artifact;
        self
    }

    fn with_last_error(mut self, update: ErrorUpdate) -> Self {
        self.last_error = update;
        self
    }

    /// Returns the task this transition targets.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the status the transition was resolved from.
    #[must_use]
    pub const fn from(&self) -> TaskStatus {
        self.from
    }

    /// Returns the status the transition moves to.
    #[must_use]
    pub const fn to(&self) -> TaskStatus {
        self.to
    }

    /// Returns the artifact recorded by the transition.
    #[must_use]
    pub const fn artifact(&self) -> Option<&StageArtifact> {
        self.artifact.as_ref()
    }

    /// Returns the scheduled retry time, if the transition sets one.
    #[must_use]
    pub const fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }
}
