//! Directory-backed collaborators for local runs and integration tests.
//!
//! Real deployments plug in network clients and media tools behind the same
//! ports; these adapters move files between directories instead.

use crate::task::{
    adapters::fs::{PREPARED_DIR, content_type_for, write_atomically},
    domain::{DeliveryTarget, PayloadRef, TaskId, TaskKind},
    ports::{
        DownloadError, Downloader, FetchedMedia, PublishError, PublishRequest, Publisher,
        SideEffect, SideEffectError, SideEffectRequest, TransformError, Transformer,
    },
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs_utf8::Dir;
use minijinja::{Environment, context};
use std::io;
use std::sync::Arc;
use uuid::Uuid;

/// Serves remote identifiers as file names inside an inbox directory.
#[derive(Debug, Clone)]
pub struct DirectoryDownloader {
    inbox: Arc<Dir>,
}

impl DirectoryDownloader {
    /// Creates a downloader reading from `inbox`.
    #[must_use]
    pub const fn new(inbox: Arc<Dir>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl Downloader for DirectoryDownloader {
    async fn fetch(&self, payload: &PayloadRef) -> Result<FetchedMedia, DownloadError> {
        let name = match payload {
            PayloadRef::Remote {
                remote_id: Some(remote_id),
                ..
            } => remote_id.clone(),
            PayloadRef::Remote { url: Some(url), .. } => url
                .strip_prefix("file://")
                .map(str::to_owned)
                .ok_or_else(|| DownloadError::Invalid(format!("unsupported url {url}")))?,
            PayloadRef::Remote { .. } | PayloadRef::Inline { .. } => {
                return Err(DownloadError::Invalid("payload has nothing to fetch".to_owned()));
            }
        };
        let path = Utf8PathBuf::from(name);
        let inbox = Arc::clone(&self.inbox);
        let source = path.clone();
        let bytes = tokio::task::spawn_blocking(move || inbox.read(&source))
            .await
            .map_err(|err| DownloadError::Unavailable(err.to_string()))?
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => DownloadError::NotFound(path.to_string()),
                io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
                    DownloadError::Invalid(err.to_string())
                }
                _ => DownloadError::Unavailable(err.to_string()),
            })?;
        Ok(FetchedMedia::new(bytes, content_type_for(&path)))
    }
}

/// Copies the source artifact into `prepared/` unchanged.
#[derive(Debug, Clone)]
pub struct PassthroughTransformer {
    root: Arc<Dir>,
}

impl PassthroughTransformer {
    /// Creates a transformer working inside the storage root.
    #[must_use]
    pub const fn new(root: Arc<Dir>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn prepare(
        &self,
        task_id: TaskId,
        src_path: &Utf8Path,
        _kind: TaskKind,
    ) -> Result<Utf8PathBuf, TransformError> {
        let extension = src_path
            .extension()
            .map_or_else(String::new, |ext| format!(".{ext}"));
        let prepared = Utf8Path::new(PREPARED_DIR).join(format!("task_{task_id}{extension}"));
        let root = Arc::clone(&self.root);
        let source = src_path.to_owned();
        let target = prepared.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = root.read(&source)?;
            write_atomically(&root, &target, &bytes)
        })
        .await
        .map_err(|err| TransformError::ToolFailure(err.to_string()))?
        .map_err(|err| TransformError::ToolFailure(err.to_string()))?;
        Ok(prepared)
    }
}

/// Publishes by copying prepared media into an outbox directory.
///
/// Each post gets a fresh identifier; the caption, if any, is written next
/// to the media as `<id>.txt`.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: Arc<Dir>,
    outbox: Arc<Dir>,
}

impl DirectoryPublisher {
    /// Creates a publisher reading from `root` and writing to `outbox`.
    #[must_use]
    pub const fn new(root: Arc<Dir>, outbox: Arc<Dir>) -> Self {
        Self { root, outbox }
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
        let post_id = Uuid::new_v4().to_string();
        let extension = request
            .media_path
            .extension()
            .map_or_else(String::new, |ext| format!(".{ext}"));
        let media_name = Utf8PathBuf::from(format!("{post_id}{extension}"));
        let caption_name = Utf8PathBuf::from(format!("{post_id}.txt"));
        let root = Arc::clone(&self.root);
        let outbox = Arc::clone(&self.outbox);
        let source = request.media_path.clone();
        let caption = request.caption.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = root.read(&source)?;
            write_atomically(&outbox, &media_name, &bytes)?;
            if let Some(text) = caption {
                write_atomically(&outbox, &caption_name, text.as_bytes())?;
            }
            Ok::<(), io::Error>(())
        })
        .await
        .map_err(|err| PublishError::Unavailable(err.to_string()))?
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => PublishError::Rejected(err.to_string()),
            _ => PublishError::Unavailable(err.to_string()),
        })?;
        tracing::info!(task_id = %request.task_id, post_id = %post_id, "published to outbox");
        Ok(post_id)
    }
}

/// Side effect that renders a message template and writes it to the log.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    target: DeliveryTarget,
    template: String,
}

impl LogNotifier {
    /// Creates a notifier recording deliveries under `target`.
    #[must_use]
    pub fn new(target: DeliveryTarget, template: impl Into<String>) -> Self {
        Self {
            target,
            template: template.into(),
        }
    }
}

#[async_trait]
impl SideEffect for LogNotifier {
    fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    async fn run(&self, request: &SideEffectRequest) -> Result<Option<String>, SideEffectError> {
        let environment = Environment::new();
        let message = environment
            .render_str(
                &self.template,
                context! {
                    task_id => request.task_id.to_string(),
                    kind => request.kind.as_str(),
                    post_id => request.external_post_id.as_str(),
                    caption => request.caption.as_deref().unwrap_or_default(),
                },
            )
            .map_err(|err| SideEffectError::Rejected(err.to_string()))?;
        tracing::info!(
            target: "mediarelay::notify",
            task_id = %request.task_id,
            notifier = %self.target,
            "{message}"
        );
        Ok(None)
    }
}
