//! Error Types
//!
//! Two families of errors live here:
//!
//! - [`InstrumentationError`]: failures inside the measurement layer. These
//!   never leave the hook adapter; they are logged and discarded.
//! - [`PipelineError`]: failures of the reference host pipeline, which are
//!   the host's own errors and propagate normally.

use thiserror::Error;

/// Failure raised while sampling, computing or emitting metrics.
#[derive(Debug, Error)]
pub enum InstrumentationError {
    /// A measurement backend (process statistics, accelerator) is absent.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),

    /// A backend was present but the reading failed.
    #[error("sampling failed: {0}")]
    Sampling(String),

    /// A task completion was observed without a recorded baseline.
    #[error("no baseline recorded for task '{0}'")]
    MissingBaseline(String),

    /// A run-level reading was requested while no run is active.
    #[error("no active run")]
    NoActiveRun,

    /// Building or serializing an outbound event failed.
    #[error("failed to build event '{event}': {reason}")]
    Emission { event: String, reason: String },

    /// A lock guarding backend state was poisoned by an earlier panic.
    #[error("state lock poisoned")]
    StatePoisoned,
}

impl From<serde_json::Error> for InstrumentationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Emission {
            event: "<payload>".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors produced by the reference pipeline host.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read pipeline file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline has no tasks")]
    Empty,

    #[error("duplicate task ID: '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("pipeline contains cyclic dependencies")]
    CyclicDependency,

    #[error("task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
