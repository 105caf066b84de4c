//! Ports for the external collaborators each pipeline stage calls.
//!
//! Every error type classifies itself as transient or permanent through a
//! `class()` method so the pipeline can consult the retry policy without
//! knowing adapter details.

use crate::task::domain::{DeliveryTarget, FailureClass, PayloadRef, TaskId, TaskKind};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Bytes fetched for a task's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    /// Raw content.
    pub bytes: Vec<u8>,
    /// MIME type reported by the source.
    pub content_type: String,
}

impl FetchedMedia {
    /// Creates fetched media.
    #[must_use]
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }
}

/// Fetches remote payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetches the content referenced by `payload`.
    async fn fetch(&self, payload: &PayloadRef) -> Result<FetchedMedia, DownloadError>;
}

/// Download failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Network failure or temporary upstream error.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The source no longer has the media.
    #[error("media not found: {0}")]
    NotFound(String),
    /// The payload cannot be fetched by this downloader.
    #[error("invalid payload: {0}")]
    Invalid(String),
}

impl DownloadError {
    /// Returns the retry class of the failure.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) => FailureClass::Transient,
            Self::NotFound(_) | Self::Invalid(_) => FailureClass::Permanent,
        }
    }
}

/// Persists downloaded media and returns its stored path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Stores the source media for `task_id`.
    async fn persist(&self, task_id: TaskId, media: &FetchedMedia)
    -> Result<Utf8PathBuf, StorageError>;
}

/// Media storage failures. Always transient.
#[derive(Debug, Error)]
#[error("media storage failed: {0}")]
pub struct StorageError(#[from] pub std::io::Error);

/// Produces a publishable artifact from stored source media.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Prepares `src_path` and returns the prepared artifact path.
    async fn prepare(
        &self,
        task_id: TaskId,
        src_path: &Utf8Path,
        kind: TaskKind,
    ) -> Result<Utf8PathBuf, TransformError>;
}

/// Transform failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    /// The transformer cannot handle this kind of content.
    #[error("unsupported kind: {0}")]
    UnsupportedKind(TaskKind),
    /// The external tool crashed or could not be started.
    #[error("tool failure: {0}")]
    ToolFailure(String),
}

impl TransformError {
    /// Returns the retry class of the failure.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::UnsupportedKind(_) => FailureClass::Permanent,
            Self::ToolFailure(_) => FailureClass::Transient,
        }
    }
}

/// Input handed to a [`Publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Task being published.
    pub task_id: TaskId,
    /// Content kind.
    pub kind: TaskKind,
    /// Prepared artifact.
    pub media_path: Utf8PathBuf,
    /// Rendered caption.
    pub caption: Option<String>,
}

/// Posts prepared content to the destination channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes and returns the identifier the destination assigned.
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError>;
}

/// Publish failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The destination asked the caller to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Network failure or temporary destination error.
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    /// The destination refused the content.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl PublishError {
    /// Returns the retry class of the failure.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited(_) | Self::Unavailable(_) => FailureClass::Transient,
            Self::Rejected(_) => FailureClass::Permanent,
        }
    }
}

/// Input handed to a [`SideEffect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectRequest {
    /// Posted task.
    pub task_id: TaskId,
    /// Content kind.
    pub kind: TaskKind,
    /// Identifier the publisher assigned.
    pub external_post_id: String,
    /// Caption as stored on the task.
    pub caption: Option<String>,
    /// Prepared artifact, when one exists.
    pub media_path: Option<Utf8PathBuf>,
}

/// Best-effort action run after a task is posted, such as a notification.
///
/// Failures are retried on the side effect's own delivery record and never
/// affect the task's status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SideEffect: Send + Sync {
    /// Delivery target this side effect records its attempts under.
    fn target(&self) -> &DeliveryTarget;

    /// Runs the side effect, returning an optional receipt identifier.
    async fn run(&self, request: &SideEffectRequest) -> Result<Option<String>, SideEffectError>;
}

/// Side-effect failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SideEffectError {
    /// Temporary failure.
    #[error("side effect unavailable: {0}")]
    Unavailable(String),
    /// The side effect cannot succeed for this task.
    #[error("side effect rejected: {0}")]
    Rejected(String),
}

impl SideEffectError {
    /// Returns the retry class of the failure.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) => FailureClass::Transient,
            Self::Rejected(_) => FailureClass::Permanent,
        }
    }
}
