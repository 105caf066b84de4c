//! Mediarelay: a crash-safe relay that turns inbound media events into
//! published posts.
//!
//! Events are deduplicated into durable tasks, claimed by a dispatcher,
//! and driven through download, prepare and publish by a pool of workers.
//! Failures are retried on a persisted backoff schedule and interrupted
//! work is settled on the next start.
//!
//! # Architecture
//!
//! Mediarelay follows hexagonal architecture principles:
//!
//! - **Domain**: Task state machine and retry policy with no infrastructure
//! - **Ports**: Store and collaborator traits
//! - **Adapters**: `PostgreSQL`, in-memory, filesystem and webhook adapters
//!
//! # Modules
//!
//! - [`task`]: Task model, ports, adapters and services
//! - [`config`]: Layered runtime configuration
//! - [`telemetry`]: Tracing subscriber setup
//! - [`clock`]: Manually driven clock for deterministic scheduling

pub mod clock;
pub mod config;
pub mod task;
pub mod telemetry;
