//! Darkroom: Generation Workflow Orchestrator
//!
//! Drives image-generation steps against an asynchronous backend: submits
//! jobs, monitors them with backoff, correlates produced artifacts back to
//! the step that asked for them, and retrieves them through a durable,
//! prioritized queue. Steps form per-session trees that users branch from
//! and select within.

pub mod api;
pub mod artifacts;
pub mod cli;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod store;
pub mod types;
pub mod workflow;
