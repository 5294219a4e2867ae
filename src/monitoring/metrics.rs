//! Metric Computation
//!
//! Pure functions turning a baseline and an end snapshot into the payloads
//! published by the hook. Deltas are signed and never clamped: memory that
//! a task frees shows up as a negative value.

use serde::Serialize;

use super::sampler::ResourceSnapshot;
use super::session::{RunBaseline, TaskBaseline};

/// Resource usage of one finished task.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskMetric {
    /// Task id
    pub node: String,
    /// Run id
    pub prompt_id: String,
    pub execution_time_ms: u64,
    pub accelerator_memory_used: i64,
    pub cpu_time_used_ms: i64,
    pub memory_used: i64,
}

/// Resource usage of one finished run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunMetric {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    pub cpu_time_used_ms: i64,
    pub memory_used: i64,
    /// Accelerator peak since the last reset, not a delta
    pub total_accelerator_memory_used: u64,
}

/// Computes the metric of a task from its baseline and end readings.
pub fn compute_task_metric(
    task_id: &str,
    run_id: &str,
    baseline: &TaskBaseline,
    end: &ResourceSnapshot,
) -> TaskMetric {
    TaskMetric {
        node: task_id.to_string(),
        prompt_id: run_id.to_string(),
        execution_time_ms: elapsed_ms(baseline.start_wall, end),
        accelerator_memory_used: signed_delta(baseline.start_accelerator_peak, end.accelerator_peak),
        cpu_time_used_ms: seconds_to_ms(end.cpu_time - baseline.start_cpu),
        memory_used: signed_delta(baseline.start_memory, end.memory),
    }
}

/// Computes the metric of a run from its baseline and end readings.
pub fn compute_run_metric(baseline: &RunBaseline, end: &ResourceSnapshot) -> RunMetric {
    RunMetric {
        execution_time_ms: Some(elapsed_ms(baseline.start_wall, end)),
        cpu_time_used_ms: seconds_to_ms(end.cpu_time - baseline.start_cpu),
        memory_used: signed_delta(baseline.start_memory, end.memory),
        total_accelerator_memory_used: end.accelerator_peak,
    }
}

fn elapsed_ms(start: std::time::Instant, end: &ResourceSnapshot) -> u64 {
    // saturates to zero if `end` predates `start`
    let elapsed = end.wall.saturating_duration_since(start);
    (elapsed.as_secs_f64() * 1000.0).round() as u64
}

fn seconds_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

fn signed_delta(start: u64, end: u64) -> i64 {
    end as i64 - start as i64
}
