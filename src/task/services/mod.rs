//! Application services: ingestion, the stage pipeline, dispatching,
//! workers, startup recovery and the runtime that ties them together.

mod caption;
mod dispatcher;
mod ingest;
mod pipeline;
mod resume;
mod runtime;
mod worker;

pub use caption::{CaptionTemplate, CaptionTemplateError, DEFAULT_CAPTION_TEMPLATE};
pub use dispatcher::{DispatchMode, Dispatcher, DispatcherSettings, WorkItem};
pub use ingest::{IngestError, IngestOutcome, IngestService, IngestSummary};
pub use pipeline::{
    Collaborators, PipelineError, PipelineOutcome, PipelineSettings, StagePipeline,
};
pub use resume::{ResumeManager, ResumeReport};
pub use runtime::{RelayRuntime, RelaySettings, RuntimeError};
pub use worker::WorkerPool;
