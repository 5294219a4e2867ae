//! Metric Reporting
//!
//! Packages computed metrics into outbound broadcast events and
//! human-readable console lines.

use log::info;
use serde_json::Value;

use super::metrics::{RunMetric, TaskMetric};
use crate::config::{HookConfig, RunFinishedPolicy};
use crate::error::InstrumentationError;
use crate::hooks::Broadcaster;

const MIB: f64 = 1024.0 * 1024.0;

/// An event waiting to be handed to the host broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub data: Value,
    pub sid: Option<String>,
}

/// Formats the per-task console line.
///
/// ```
/// use exectime::monitoring::{console_line, TaskMetric};
///
/// let metric = TaskMetric {
///     node: "4".to_string(),
///     prompt_id: "p".to_string(),
///     execution_time_ms: 1250,
///     accelerator_memory_used: 0,
///     cpu_time_used_ms: 900,
///     memory_used: 1048576,
/// };
/// assert_eq!(
///     console_line("KSampler", &metric),
///     "#4 [KSampler]: 1.25s | CPU 0.900s | RAM 1.00MB | VRAM 0.00MB"
/// );
/// ```
pub fn console_line(task_type: &str, metric: &TaskMetric) -> String {
    format!(
        "#{} [{}]: {:.2}s | CPU {:.3}s | RAM {:.2}MB | VRAM {:.2}MB",
        metric.node,
        task_type,
        metric.execution_time_ms as f64 / 1000.0,
        metric.cpu_time_used_ms as f64 / 1000.0,
        metric.memory_used as f64 / MIB,
        metric.accelerator_memory_used as f64 / MIB,
    )
}

/// Formats the end-of-run summary line.
pub fn run_summary_line(run_id: &str, metric: &RunMetric) -> String {
    let elapsed = metric
        .execution_time_ms
        .map(|ms| format!("{:.2}s", ms as f64 / 1000.0))
        .unwrap_or_else(|| "n/a".to_string());

    format!(
        "Run {} finished in {} | CPU {:.3}s | RAM {:.2}MB | peak VRAM {:.2}MB",
        if run_id.is_empty() { "<unknown>" } else { run_id },
        elapsed,
        metric.cpu_time_used_ms as f64 / 1000.0,
        metric.memory_used as f64 / MIB,
        metric.total_accelerator_memory_used as f64 / MIB,
    )
}

/// Builds outbound events and console output according to a [`HookConfig`].
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    config: HookConfig,
}

impl EventEmitter {
    pub fn new(config: HookConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /// Prints the console line for a finished task.
    pub fn report_task(&self, task_type: &str, metric: &TaskMetric) {
        if self.config.console_report {
            info!("{}", console_line(task_type, metric));
        }
    }

    /// Prints the summary line for a finished run.
    pub fn report_run(&self, run_id: &str, metric: &RunMetric) {
        if self.config.console_report {
            info!("{}", run_summary_line(run_id, metric));
        }
    }

    /// Builds the per-task event addressed to `sid`.
    ///
    /// Without a destination the event goes to every subscriber unless
    /// the policy requires one.
    pub fn node_executed(
        &self,
        metric: &TaskMetric,
        sid: Option<&str>,
    ) -> Result<Option<OutboundEvent>, InstrumentationError> {
        if !self.config.emit_events || !self.destination_allowed(sid) {
            return Ok(None);
        }

        let event = self.config.node_executed_event();
        let data = serde_json::to_value(metric).map_err(|e| InstrumentationError::Emission {
            event: event.clone(),
            reason: e.to_string(),
        })?;

        Ok(Some(OutboundEvent {
            event,
            data,
            sid: sid.map(str::to_string),
        }))
    }

    fn destination_allowed(&self, sid: Option<&str>) -> bool {
        sid.is_some() || self.config.run_finished == RunFinishedPolicy::Always
    }

    /// Builds the per-run event from the host's run-end payload.
    ///
    /// The host payload is copied and extended with the run metric.
    pub fn run_finished(
        &self,
        host_payload: &Value,
        metric: &RunMetric,
        sid: Option<&str>,
    ) -> Result<Option<OutboundEvent>, InstrumentationError> {
        if !self.config.emit_events {
            return Ok(None);
        }
        if !self.destination_allowed(sid) {
            return Ok(None);
        }

        let event = self.config.run_finished_event();
        let emission_error = |reason: String| InstrumentationError::Emission {
            event: event.clone(),
            reason,
        };

        let mut data = match host_payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => return Err(emission_error(format!("payload is not an object: {}", other))),
        };

        match serde_json::to_value(metric).map_err(|e| emission_error(e.to_string()))? {
            Value::Object(fields) => data.extend(fields),
            _ => return Err(emission_error("metric did not serialize to an object".to_string())),
        }

        Ok(Some(OutboundEvent {
            event,
            data: Value::Object(data),
            sid: sid.map(str::to_string),
        }))
    }
}

/// Hands events to the host broadcaster in order.
pub fn publish(events: Vec<OutboundEvent>, target: &dyn Broadcaster) {
    for outbound in events {
        target.send_sync(&outbound.event, &outbound.data, outbound.sid.as_deref());
    }
}
