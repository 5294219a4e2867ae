//! Reference host pipeline
//!
//! A small sequential task runner that exposes the interception points the
//! execution-time hook attaches to. Used by the CLI and by end-to-end tests.

pub mod model;
pub mod runner;
pub mod server;
pub mod task;

pub use model::{load_pipeline, parse_pipeline, PipelineDef, TaskDef};
pub use runner::{DispatchSignature, RunReport, Runner};
pub use server::{EventSink, JsonLinesSink, PromptServer, RecordedEvent, RecordingSink};
pub use task::run_task;
