//! Adapter implementations for task ports.

pub mod fs;
pub mod local;
pub mod memory;
pub mod postgres;
pub mod webhook;
