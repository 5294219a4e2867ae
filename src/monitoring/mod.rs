//! Resource Monitoring Module
//!
//! Measurement primitives used by the execution-time hook.
//!
//! # Components
//!
//! - [`ResourceSampler`]: CPU time, resident memory and accelerator peak readings
//! - [`SessionStore`]: baselines of the live run and its tasks
//! - [`compute_task_metric`] / [`compute_run_metric`]: baseline-vs-end deltas
//! - [`EventEmitter`]: outbound events and console lines

pub mod accelerator;
pub mod metrics;
pub mod report;
pub mod sampler;
pub mod session;

pub use accelerator::{AcceleratorMemory, NullAccelerator, TrackedAccelerator};
pub use metrics::{compute_run_metric, compute_task_metric, RunMetric, TaskMetric};
pub use report::{console_line, publish, run_summary_line, EventEmitter, OutboundEvent};
pub use sampler::{
    NullStats, ProcessSample, ProcessStats, ResourceSampler, ResourceSnapshot, SysinfoStats,
};
pub use session::{RunBaseline, SessionStore, TaskBaseline};
