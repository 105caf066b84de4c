//! Durable media relay tasks.
//!
//! An inbound event becomes a task that moves through download, prepare and
//! publish, surviving restarts and retrying transient failures on a
//! persisted backoff schedule. The module follows hexagonal architecture:
//!
//! - Domain types and the state machine in [`domain`]
//! - Port contracts for the store and stage collaborators in [`ports`]
//! - Store, filesystem, webhook and local collaborator adapters in
//!   [`adapters`]
//! - Ingestion, pipeline, dispatching and recovery services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
