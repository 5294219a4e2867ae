//! exectime - Execution Time Instrumentation for Task Pipelines
//!
//! Measures, for every task of a pipeline run and for the run as a whole,
//! wall-clock time, CPU time, resident memory and peak accelerator memory.
//! Results are printed as console lines and broadcast as
//! `execution_time.node_executed` / `execution_time.run_finished` events.
//!
//! # Architecture
//!
//! - [`monitoring`]: resource sampling, per-run sessions, metric math and reporting
//! - [`hooks`]: the host interface and the lifecycle state machine attached to it
//! - [`pipeline`]: a reference host that runs shell tasks and exposes the hook points
//! - [`config`]: instrumentation settings
//!
//! Instrumentation never breaks the host: sampling or reporting failures are
//! logged and the host's own behavior is left unchanged.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use exectime::pipeline::{load_pipeline, JsonLinesSink, PromptServer, Runner};
//! use exectime::{ExecutionTimeHook, HookConfig, ResourceSampler};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = load_pipeline("pipeline.yaml")?;
//!
//!     let hook = Arc::new(ExecutionTimeHook::new(
//!         ResourceSampler::detect(),
//!         HookConfig::default(),
//!     ));
//!
//!     let mut runner = Runner::new(pipeline);
//!     runner.register_hook(hook);
//!
//!     let server = PromptServer::new(JsonLinesSink::new(std::io::stdout())).with_client_id("cli");
//!     runner.run(&server, "run-1")?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod monitoring;
pub mod pipeline;

// Re-export commonly used types
pub use config::{HookConfig, RunFinishedPolicy};
pub use error::{InstrumentationError, PipelineError};
pub use hooks::{Broadcaster, ExecutionTimeHook, HookState, HostCapabilities, InterceptionPoint};
pub use monitoring::{ResourceSampler, RunMetric, TaskMetric};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "exectime";
