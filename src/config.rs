//! Instrumentation Configuration
//!
//! Controls what the execution-time hook reports and where. All fields are
//! optional when deserialized, so an `instrumentation:` section in a
//! pipeline file only needs to mention what it changes.
//!
//! ```yaml
//! instrumentation:
//!   console_report: true
//!   emit_events: true
//!   run_finished: require_destination
//!   event_prefix: execution_time
//! ```

use serde::{Deserialize, Serialize};

/// Default namespace for emitted event names.
pub const DEFAULT_EVENT_PREFIX: &str = "execution_time";

/// When to emit metric events whose triggering signal names no destination.
///
/// Task events from the dispatch path always carry the host's client id and
/// are not affected.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunFinishedPolicy {
    /// Emit without a destination id (the event is then broadcast to
    /// every subscriber).
    #[default]
    Always,
    /// Only emit when the triggering signal names a destination.
    RequireDestination,
}

/// Settings for [`ExecutionTimeHook`](crate::hooks::ExecutionTimeHook).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HookConfig {
    /// Print one summary line per finished task.
    pub console_report: bool,

    /// Publish metric events through the host broadcaster.
    pub emit_events: bool,

    /// Emission rule for signals without a destination.
    pub run_finished: RunFinishedPolicy,

    /// Prefix for emitted event names (`<prefix>.node_executed`).
    pub event_prefix: String,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            console_report: true,
            emit_events: true,
            run_finished: RunFinishedPolicy::Always,
            event_prefix: DEFAULT_EVENT_PREFIX.to_string(),
        }
    }
}

impl HookConfig {
    pub fn with_console_report(mut self, enabled: bool) -> Self {
        self.console_report = enabled;
        self
    }

    pub fn with_events(mut self, enabled: bool) -> Self {
        self.emit_events = enabled;
        self
    }

    pub fn with_run_finished(mut self, policy: RunFinishedPolicy) -> Self {
        self.run_finished = policy;
        self
    }

    /// Full name of the per-task event.
    pub fn node_executed_event(&self) -> String {
        format!("{}.node_executed", self.event_prefix)
    }

    /// Full name of the per-run event.
    pub fn run_finished_event(&self) -> String {
        format!("{}.run_finished", self.event_prefix)
    }
}
