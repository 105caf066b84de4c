//! Pipeline stages and the outcomes they report back to the task.

use super::TaskStatus;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered processing stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the source media and persist it locally.
    Download,
    /// Transform the source into a publishable artifact.
    Prepare,
    /// Hand the prepared artifact to the publisher.
    Publish,
}

impl Stage {
    /// Returns the stage name used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Prepare => "prepare",
            Self::Publish => "publish",
        }
    }

    /// Status recorded while the stage runs, if the stage has one.
    ///
    /// Publishing has no intermediate status: the publish delivery record
    /// tracks the in-flight attempt instead.
    #[must_use]
    pub const fn started_status(self) -> Option<TaskStatus> {
        match self {
            Self::Download => Some(TaskStatus::Downloading),
            Self::Prepare => Some(TaskStatus::Preparing),
            Self::Publish => None,
        }
    }

    /// Status recorded when the stage succeeds.
    #[must_use]
    pub const fn completed_status(self) -> TaskStatus {
        match self {
            Self::Download => TaskStatus::Downloaded,
            Self::Prepare => TaskStatus::Prepared,
            Self::Publish => TaskStatus::Posted,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network errors, timeouts, rate limits, tool crashes.
    Transient,
    /// Unsupported input, not found, rejected content.
    Permanent,
}

/// A classified stage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    class: FailureClass,
    message: String,
}

impl StageFailure {
    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    /// Creates a failure with an explicit class.
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Returns the failure class.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        self.class
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Artifact produced by a successful stage. Each is written once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageArtifact {
    /// Locally persisted source media.
    Source(Utf8PathBuf),
    /// Prepared media ready for publishing.
    Prepared(Utf8PathBuf),
    /// Identifier returned by the publisher.
    ExternalPost(String),
}

impl StageArtifact {
    /// Returns the persisted column this artifact fills.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        match self {
            Self::Source(_) => "src_path",
            Self::Prepared(_) => "prepared_path",
            Self::ExternalPost(_) => "external_post_id",
        }
    }

    /// Returns the stage that produces this artifact.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Source(_) => Stage::Download,
            Self::Prepared(_) => Stage::Prepare,
            Self::ExternalPost(_) => Stage::Publish,
        }
    }

    /// Returns the artifact path when the artifact is a file.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Source(path) | Self::Prepared(path) => Some(path),
            Self::ExternalPost(_) => None,
        }
    }
}

/// What happened when a stage ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage is about to call its collaborator.
    Started,
    /// The stage succeeded, optionally producing an artifact.
    Completed(Option<StageArtifact>),
    /// The stage failed.
    Failed(StageFailure),
}
