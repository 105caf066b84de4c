//! Port contracts for task persistence and stage collaborators.

mod collaborators;
mod store;

pub use collaborators::{
    DownloadError, Downloader, FetchedMedia, MediaStorage, PublishError, PublishRequest,
    Publisher, SideEffect, SideEffectError, SideEffectRequest, StorageError, TransformError,
    Transformer,
};
#[cfg(test)]
pub use collaborators::{
    MockDownloader, MockMediaStorage, MockPublisher, MockSideEffect, MockTransformer,
};
pub use store::{TaskStore, TaskStoreError, TaskStoreResult};
