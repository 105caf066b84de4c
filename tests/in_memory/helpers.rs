//! Shared fixtures for in-memory relay integration tests.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs_utf8::Dir;
use chrono::{DateTime, TimeZone, Utc};
use eyre::OptionExt;
use mediarelay::clock::ManualClock;
use mediarelay::task::{
    adapters::{
        fs::{FsMediaStorage, open_dir},
        local::{DirectoryDownloader, DirectoryPublisher, PassthroughTransformer},
        memory::InMemoryTaskStore,
    },
    domain::{
        ClaimedTask, Delivery, DeliveryId, DeliveryStatus, DeliveryTarget, MediaKind,
        NormalizedEvent, PayloadRef, RetryPolicy, StageTransition, Task, TaskId, TaskStatus,
    },
    ports::{
        DownloadError, Downloader, FetchedMedia, SideEffect, SideEffectError, SideEffectRequest,
        TaskStore, TaskStoreError, TaskStoreResult,
    },
    services::{CaptionTemplate, Collaborators, PipelineSettings},
};
use rstest::fixture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Delivery target guarding the publish call in every test.
pub const PUBLISH_TARGET: &str = "status";

/// Fixed start instant for clock-driven scenarios.
#[must_use]
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid start timestamp")
}

/// Provides a fresh in-memory store for each test.
#[fixture]
pub fn store() -> Arc<InMemoryTaskStore> {
    Arc::new(InMemoryTaskStore::new())
}

/// Provides a manual clock frozen at [`start`].
#[fixture]
pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start()))
}

/// Builds a photo event whose remote identifier names an inbox file.
#[must_use]
pub fn photo_event(source_id: &str, file_name: &str, caption: Option<&str>) -> NormalizedEvent {
    NormalizedEvent::Media {
        source: "webhook".to_owned(),
        source_id: Some(source_id.to_owned()),
        kind: MediaKind::Photo,
        remote_id: Some(file_name.to_owned()),
        url: None,
        caption: caption.map(str::to_owned),
    }
}

/// Builds a text event.
#[must_use]
pub fn text_event(source_id: &str, text: &str) -> NormalizedEvent {
    NormalizedEvent::Text {
        source: "bot".to_owned(),
        source_id: Some(source_id.to_owned()),
        text: text.to_owned(),
    }
}

/// Returns the publish delivery target.
#[must_use]
pub fn publish_target() -> DeliveryTarget {
    DeliveryTarget::new(PUBLISH_TARGET).expect("valid publish target")
}

/// Pipeline settings with the default retry table.
#[must_use]
pub fn pipeline_settings() -> PipelineSettings {
    pipeline_settings_with(RetryPolicy::default())
}

/// Pipeline settings with a custom retry policy.
#[must_use]
pub fn pipeline_settings_with(policy: RetryPolicy) -> PipelineSettings {
    PipelineSettings {
        policy,
        collaborator_timeout: Duration::from_secs(5),
        publish_target: publish_target(),
        caption: CaptionTemplate::default(),
    }
}

/// Temporary inbox, storage root and outbox wired to the directory
/// adapters.
pub struct LocalRig {
    _temp: TempDir,
    root: Utf8PathBuf,
    inbox: Arc<Dir>,
    storage: FsMediaStorage,
    outbox: Arc<Dir>,
}

impl LocalRig {
    /// Creates the directories under a fresh temporary root.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn new() -> eyre::Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = Utf8Path::from_path(temp.path())
            .ok_or_eyre("temporary directory is not UTF-8")?
            .to_owned();
        let storage = FsMediaStorage::open(&root.join("media"))?;
        let inbox = Arc::new(open_dir(&root.join("inbox"))?);
        let outbox = Arc::new(open_dir(&root.join("outbox"))?);
        Ok(Self {
            _temp: temp,
            root,
            inbox,
            storage,
            outbox,
        })
    }

    /// Places a file in the inbox for the downloader to serve.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn add_inbox_file(&self, name: &str, bytes: &[u8]) -> eyre::Result<()> {
        self.inbox.write(name, bytes)?;
        Ok(())
    }

    /// Returns a downloader reading from the inbox.
    #[must_use]
    pub fn downloader(&self) -> Arc<dyn Downloader> {
        Arc::new(DirectoryDownloader::new(Arc::clone(&self.inbox)))
    }

    /// Wires the directory adapters around `downloader`.
    #[must_use]
    pub fn collaborators_with(
        &self,
        downloader: Arc<dyn Downloader>,
        side_effects: Vec<Arc<dyn SideEffect>>,
    ) -> Collaborators {
        Collaborators {
            downloader,
            storage: Arc::new(self.storage.clone()),
            transformer: Arc::new(PassthroughTransformer::new(self.storage.root())),
            publisher: Arc::new(DirectoryPublisher::new(
                self.storage.root(),
                Arc::clone(&self.outbox),
            )),
            side_effects,
        }
    }

    /// Wires the directory adapters with no side effects.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with(self.downloader(), Vec::new())
    }

    /// Reads a file relative to the storage root.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_stored(&self, path: &Utf8Path) -> eyre::Result<Vec<u8>> {
        Ok(self.storage.root().read(path)?)
    }

    /// Reads a file from the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_outbox(&self, name: &str) -> eyre::Result<Vec<u8>> {
        Ok(self.outbox.read(name)?)
    }

    /// Lists outbox file names in sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox cannot be listed.
    pub fn outbox_entries(&self) -> eyre::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join("outbox"))? {
            let name = entry?
                .file_name()
                .into_string()
                .map_err(|raw| eyre::eyre!("non UTF-8 outbox entry {raw:?}"))?;
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Downloader that fails transiently a fixed number of times before
/// delegating.
pub struct FlakyDownloader {
    inner: Arc<dyn Downloader>,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyDownloader {
    /// Fails the first `failures` fetches.
    #[must_use]
    pub const fn new(inner: Arc<dyn Downloader>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of fetches attempted so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for FlakyDownloader {
    async fn fetch(&self, payload: &PayloadRef) -> Result<FetchedMedia, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DownloadError::Unavailable("connection reset".to_owned()));
        }
        self.inner.fetch(payload).await
    }
}

/// Side effect that records each run and fails the first few transiently.
pub struct RecordingSideEffect {
    target: DeliveryTarget,
    failures_left: AtomicU32,
    runs: AtomicU32,
}

impl RecordingSideEffect {
    /// Creates a side effect for `target` that fails `failures` times.
    #[must_use]
    pub fn new(target: &str, failures: u32) -> Self {
        Self {
            target: DeliveryTarget::new(target).expect("valid side effect target"),
            failures_left: AtomicU32::new(failures),
            runs: AtomicU32::new(0),
        }
    }

    /// Number of runs attempted so far.
    #[must_use]
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SideEffect for RecordingSideEffect {
    fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    async fn run(&self, request: &SideEffectRequest) -> Result<Option<String>, SideEffectError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SideEffectError::Unavailable("notifier offline".to_owned()));
        }
        Ok(Some(format!("notified-{}", request.external_post_id)))
    }
}

/// Downloader that crashes on one remote identifier and delegates the rest.
pub struct PanickingDownloader {
    inner: Arc<dyn Downloader>,
    poisoned: String,
}

impl PanickingDownloader {
    /// Panics whenever `poisoned` is fetched.
    #[must_use]
    pub fn new(inner: Arc<dyn Downloader>, poisoned: &str) -> Self {
        Self {
            inner,
            poisoned: poisoned.to_owned(),
        }
    }
}

#[async_trait]
impl Downloader for PanickingDownloader {
    async fn fetch(&self, payload: &PayloadRef) -> Result<FetchedMedia, DownloadError> {
        if let PayloadRef::Remote { remote_id, .. } = payload
            && remote_id.as_deref() == Some(self.poisoned.as_str())
        {
            std::panic::panic_any(format!("downloader crashed on {}", self.poisoned));
        }
        self.inner.fetch(payload).await
    }
}

/// Task store whose next transitions fail with a persistence error.
pub struct FlakyStore {
    inner: InMemoryTaskStore,
    failing_transitions: AtomicU32,
}

impl FlakyStore {
    /// Wraps `inner`, sharing its state.
    #[must_use]
    pub fn new(inner: &InMemoryTaskStore) -> Self {
        Self {
            inner: inner.clone(),
            failing_transitions: AtomicU32::new(0),
        }
    }

    /// Fails the next `count` transitions.
    pub fn fail_next_transitions(&self, count: u32) {
        self.failing_transitions.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_if_absent(&self, task: &Task) -> TaskStoreResult<Option<TaskId>> {
        self.inner.insert_if_absent(task).await
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        self.inner.claim_next(now, max_attempts).await
    }

    async fn claim(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        self.inner.claim(task_id, now, max_attempts).await
    }

    async fn apply_transition(&self, transition: &StageTransition) -> TaskStoreResult<Task> {
        let failing = self
            .failing_transitions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TaskStoreError::persistence(std::io::Error::other(
                "connection lost",
            )));
        }
        self.inner.apply_transition(transition).await
    }

    async fn get(&self, task_id: TaskId) -> TaskStoreResult<Option<Task>> {
        self.inner.get(task_id).await
    }

    async fn list_resumable(&self) -> TaskStoreResult<Vec<Task>> {
        self.inner.list_resumable().await
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Task>> {
        self.inner.list_by_status(status, limit).await
    }

    async fn ensure_delivery(
        &self,
        task_id: TaskId,
        target: &DeliveryTarget,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Delivery> {
        self.inner.ensure_delivery(task_id, target, now).await
    }

    async fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<Delivery>> {
        self.inner.claim_delivery(delivery_id, now, max_attempts).await
    }

    async fn claim_due_deliveries(
        &self,
        targets: &[DeliveryTarget],
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        self.inner
            .claim_due_deliveries(targets, now, max_attempts, limit)
            .await
    }

    async fn update_delivery(&self, delivery: &Delivery) -> TaskStoreResult<()> {
        self.inner.update_delivery(delivery).await
    }

    async fn list_deliveries(&self, task_id: TaskId) -> TaskStoreResult<Vec<Delivery>> {
        self.inner.list_deliveries(task_id).await
    }

    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        self.inner.list_deliveries_by_status(status, limit).await
    }
}
