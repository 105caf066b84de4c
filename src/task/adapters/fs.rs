//! Capability-scoped media storage.
//!
//! Artifacts live under one storage root: sources in `original/`, prepared
//! media in `prepared/`. Stored paths are relative to the root so every
//! adapter sharing the root resolves them the same way.

use crate::task::{
    domain::TaskId,
    ports::{FetchedMedia, MediaStorage, StorageError},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use std::io;
use std::sync::Arc;

/// Directory holding downloaded source media.
pub const ORIGINAL_DIR: &str = "original";
/// Directory holding prepared media.
pub const PREPARED_DIR: &str = "prepared";

/// Opens `path` as a capability directory, creating it when missing.
///
/// # Errors
///
/// Returns the underlying I/O error when the directory cannot be created
/// or opened.
pub fn open_dir(path: &Utf8Path) -> io::Result<Dir> {
    Dir::create_ambient_dir_all(path, ambient_authority())?;
    Dir::open_ambient_dir(path, ambient_authority())
}

/// Maps a MIME type to a file extension, including the leading dot.
#[must_use]
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/quicktime" => ".mov",
        "video/webm" => ".webm",
        "text/plain" => ".txt",
        _ => ".bin",
    }
}

/// Maps a file extension back to a MIME type.
#[must_use]
pub fn content_type_for(path: &Utf8Path) -> &'static str {
    match path
        .extension()
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Writes `bytes` to `path` inside `dir` through a temporary sibling, so a
/// reader never sees a partially written file.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write_atomically(dir: &Dir, path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp = path.with_file_name(format!(".{file_name}.partial"));
    dir.write(&temp, bytes)?;
    dir.rename(&temp, dir, path)
}

/// Media storage rooted at a capability directory.
#[derive(Debug, Clone)]
pub struct FsMediaStorage {
    root: Arc<Dir>,
}

impl FsMediaStorage {
    /// Opens (and creates if needed) the storage root and its
    /// subdirectories.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when a directory cannot be created.
    pub fn open(root: &Utf8Path) -> io::Result<Self> {
        let dir = open_dir(root)?;
        dir.create_dir_all(ORIGINAL_DIR)?;
        dir.create_dir_all(PREPARED_DIR)?;
        Ok(Self {
            root: Arc::new(dir),
        })
    }

    /// Returns the shared storage root.
    #[must_use]
    pub fn root(&self) -> Arc<Dir> {
        Arc::clone(&self.root)
    }
}

#[async_trait]
impl MediaStorage for FsMediaStorage {
    async fn persist(
        &self,
        task_id: TaskId,
        media: &FetchedMedia,
    ) -> Result<Utf8PathBuf, StorageError> {
        let relative = Utf8Path::new(ORIGINAL_DIR).join(format!(
            "task_{task_id}{}",
            extension_for(&media.content_type)
        ));
        let root = Arc::clone(&self.root);
        let bytes = media.bytes.clone();
        let target = relative.clone();
        tokio::task::spawn_blocking(move || write_atomically(&root, &target, &bytes))
            .await
            .map_err(io::Error::other)??;
        tracing::debug!(task_id = %task_id, path = %relative, "stored source media");
        Ok(relative)
    }
}
