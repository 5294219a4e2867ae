//! Run Session and Task Baselines
//!
//! Holds the baseline readings of the single live run. A new run replaces
//! the previous session wholesale, which also discards any baselines left
//! behind by an aborted run.

use std::collections::HashMap;
use std::time::Instant;

use super::sampler::{ResourceSampler, ResourceSnapshot};

/// Readings captured when a run starts.
#[derive(Debug, Clone, Copy)]
pub struct RunBaseline {
    pub start_wall: Instant,
    pub start_cpu: f64,
    pub start_memory: u64,
}

/// Readings captured when a task is about to start.
#[derive(Debug, Clone, Copy)]
pub struct TaskBaseline {
    pub start_wall: Instant,
    pub start_accelerator_peak: u64,
    pub start_cpu: f64,
    pub start_memory: u64,
}

impl From<ResourceSnapshot> for TaskBaseline {
    fn from(snapshot: ResourceSnapshot) -> Self {
        Self {
            start_wall: snapshot.wall,
            start_accelerator_peak: snapshot.accelerator_peak,
            start_cpu: snapshot.cpu_time,
            start_memory: snapshot.memory,
        }
    }
}

/// One pipeline run.
#[derive(Debug, Clone)]
pub struct Session {
    pub run: RunBaseline,
    tasks: HashMap<String, TaskBaseline>,
}

impl Session {
    fn new(run: RunBaseline) -> Self {
        Self {
            run,
            tasks: HashMap::new(),
        }
    }

    /// Number of tasks that have a baseline in this run.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Store for the live session. At most one session exists at a time.
#[derive(Debug, Default)]
pub struct SessionStore {
    session: Option<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run, replacing any existing session.
    ///
    /// Returns the replaced session, if any.
    pub fn begin_run(&mut self, sampler: &ResourceSampler) -> Option<Session> {
        let snapshot = sampler.snapshot();
        let run = RunBaseline {
            start_wall: snapshot.wall,
            start_cpu: snapshot.cpu_time,
            start_memory: snapshot.memory,
        };
        sampler.reset_accelerator_peak();

        self.session.replace(Session::new(run))
    }

    /// Records the baseline of a task that is about to start.
    ///
    /// The accelerator peak is reset first, so the baseline peak equals the
    /// allocation level at this moment. Re-recording a task overwrites its
    /// previous baseline. Returns `false` when no run is active.
    pub fn begin_task(&mut self, task_id: &str, sampler: &ResourceSampler) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        sampler.reset_accelerator_peak();
        let baseline = TaskBaseline::from(sampler.snapshot());
        session.tasks.insert(task_id.to_string(), baseline);
        true
    }

    /// Looks up a task baseline without removing it.
    pub fn task_baseline(&self, task_id: &str) -> Option<TaskBaseline> {
        self.session.as_ref()?.tasks.get(task_id).copied()
    }

    /// Baseline of the live run.
    pub fn run_baseline(&self) -> Option<RunBaseline> {
        self.session.as_ref().map(|s| s.run)
    }

    /// Returns true while a run is live.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }
}
