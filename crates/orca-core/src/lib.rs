//! Core types and error definitions for orca.
//!
//! This crate provides the vocabulary shared by the launch-and-monitor
//! subsystem: the error enum, the run configuration, the job and status data
//! model, environment-string expansion and the lock-guarded [`SharedData`]
//! container.
//!
//! # Main types
//!
//! - [`OrcaError`] — Unified error enum for all orca subsystems.
//! - [`OrcaResult`] — Convenience alias for `Result<T, OrcaError>`.
//! - [`OrcaConfig`] — Explicit run configuration, loaded from TOML.
//! - [`JobDescriptor`] — One resolved job to spawn or submit.
//! - [`WorkflowStatus`] — A status event published by a pipeline.
//! - [`SharedData`] — Reentrant-lock-protected named values.

/// Run configuration.
pub mod config;
/// `$VAR` expansion.
pub mod env_string;
/// Error types.
pub mod error;
/// Lock-guarded shared namespace.
pub mod shared;
/// Tracing subscriber setup.
pub mod telemetry;
/// Run, job and status data model.
pub mod types;

pub use config::OrcaConfig;
pub use error::{OrcaError, OrcaResult};
pub use shared::{SharedData, SharedDataGuard};
pub use types::{
    JobDescriptor, PipelineName, PipelineState, RunId, WorkflowReport, WorkflowState,
    WorkflowStatus,
};
