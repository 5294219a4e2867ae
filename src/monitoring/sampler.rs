//! Point-in-time Resource Sampling
//!
//! Reads CPU time, resident memory and peak accelerator memory for the
//! current process. Every reading degrades to zero when its backend is
//! missing or fails, so callers never have to handle errors.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;
use once_cell::sync::OnceCell;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::accelerator::{AcceleratorMemory, NullAccelerator};
use crate::error::InstrumentationError;

static PROCESS_STATS_NOTICE: OnceCell<()> = OnceCell::new();
static ACCELERATOR_NOTICE: OnceCell<()> = OnceCell::new();

/// CPU and memory reading of the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    /// User + system CPU time since process start, in seconds
    pub cpu_time: f64,
    /// Resident set size in bytes
    pub memory: u64,
}

/// Provider of process-level statistics.
pub trait ProcessStats: Send + Sync {
    /// Reads CPU time and resident memory in one refresh.
    fn sample(&self) -> Result<ProcessSample, InstrumentationError>;

    fn cpu_time(&self) -> Result<f64, InstrumentationError> {
        self.sample().map(|s| s.cpu_time)
    }

    fn memory_usage(&self) -> Result<u64, InstrumentationError> {
        self.sample().map(|s| s.memory)
    }
}

/// Process statistics backed by `sysinfo`.
pub struct SysinfoStats {
    system: Mutex<System>,
    process_id: Pid,
}

impl SysinfoStats {
    /// Creates a provider for the current process.
    ///
    /// Fails when the platform is not supported by `sysinfo` or the
    /// current PID cannot be resolved.
    pub fn new() -> Result<Self, InstrumentationError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(InstrumentationError::CapabilityUnavailable(
                "process statistics",
            ));
        }

        let process_id =
            get_current_pid().map_err(|e| InstrumentationError::Sampling(e.to_string()))?;

        Ok(Self {
            system: Mutex::new(System::new()),
            process_id,
        })
    }
}

impl ProcessStats for SysinfoStats {
    fn sample(&self) -> Result<ProcessSample, InstrumentationError> {
        let pid = self.process_id;
        let mut system = self
            .system
            .lock()
            .map_err(|_| InstrumentationError::StatePoisoned)?;

        let refresh_kind = ProcessRefreshKind::nothing().with_cpu().with_memory();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh_kind);

        let process = system
            .process(pid)
            .ok_or_else(|| InstrumentationError::Sampling(format!("process {} not found", pid)))?;

        Ok(ProcessSample {
            // accumulated_cpu_time is reported in milliseconds
            cpu_time: process.accumulated_cpu_time() as f64 / 1000.0,
            memory: process.memory(),
        })
    }
}

/// Stand-in used when no process statistics provider is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl ProcessStats for NullStats {
    fn sample(&self) -> Result<ProcessSample, InstrumentationError> {
        Err(InstrumentationError::CapabilityUnavailable(
            "process statistics",
        ))
    }
}

/// All readings taken at a single instant.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    /// Monotonic wall clock
    pub wall: Instant,
    /// CPU time in seconds
    pub cpu_time: f64,
    /// Resident memory in bytes
    pub memory: u64,
    /// Accelerator peak since last reset, in bytes
    pub accelerator_peak: u64,
}

/// Facade over the process and accelerator backends.
///
/// # Example
///
/// ```
/// use exectime::monitoring::ResourceSampler;
///
/// let sampler = ResourceSampler::detect();
/// sampler.reset_accelerator_peak();
/// let snapshot = sampler.snapshot();
/// assert!(snapshot.cpu_time >= 0.0);
/// ```
pub struct ResourceSampler {
    stats: Box<dyn ProcessStats>,
    accelerator: Arc<dyn AcceleratorMemory>,
}

impl ResourceSampler {
    /// Creates a sampler from explicit backends.
    pub fn new(stats: Box<dyn ProcessStats>, accelerator: Arc<dyn AcceleratorMemory>) -> Self {
        Self { stats, accelerator }
    }

    /// Picks the best available process statistics backend.
    ///
    /// Falls back to [`NullStats`] when `sysinfo` cannot serve this
    /// process. No accelerator is attached; see [`with_accelerator`](Self::with_accelerator).
    pub fn detect() -> Self {
        let stats: Box<dyn ProcessStats> = match SysinfoStats::new() {
            Ok(stats) => Box::new(stats),
            Err(e) => {
                note_unavailable(&PROCESS_STATS_NOTICE, &e);
                Box::new(NullStats)
            }
        };

        Self::new(stats, Arc::new(NullAccelerator))
    }

    /// Replaces the accelerator backend.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn AcceleratorMemory>) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Whether an accelerator device is attached.
    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_available()
    }

    /// CPU time consumed by the process, in seconds. Zero when unavailable.
    pub fn cpu_time(&self) -> f64 {
        read_or_zero(&PROCESS_STATS_NOTICE, || self.stats.cpu_time())
    }

    /// Resident memory in bytes. Zero when unavailable.
    pub fn memory_usage(&self) -> u64 {
        read_or_zero(&PROCESS_STATS_NOTICE, || self.stats.memory_usage())
    }

    /// Peak accelerator memory since the last reset. Zero without a device.
    pub fn peak_accelerator_memory(&self) -> u64 {
        read_or_zero(&ACCELERATOR_NOTICE, || self.accelerator.peak_allocated())
    }

    /// Resets the accelerator peak counter. No-op without a device.
    pub fn reset_accelerator_peak(&self) {
        read_or_zero(&ACCELERATOR_NOTICE, || {
            self.accelerator.reset_peak();
            Ok(())
        })
    }

    /// Takes every reading at once.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let process = read_or_zero(&PROCESS_STATS_NOTICE, || self.stats.sample());

        ResourceSnapshot {
            wall: Instant::now(),
            cpu_time: process.cpu_time,
            memory: process.memory,
            accelerator_peak: self.peak_accelerator_memory(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::detect()
    }
}

fn note_unavailable(notice: &OnceCell<()>, err: &InstrumentationError) {
    notice.get_or_init(|| debug!("{}; reporting zero", err));
}

/// Runs a backend reading; errors and panics both yield the zero value.
fn read_or_zero<T, F>(notice: &OnceCell<()>, read: F) -> T
where
    T: Default,
    F: FnOnce() -> Result<T, InstrumentationError>,
{
    match panic::catch_unwind(AssertUnwindSafe(read)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => zero_on_error(notice, e),
        Err(_) => zero_on_error(
            notice,
            InstrumentationError::Sampling("backend panicked".to_string()),
        ),
    }
}

fn zero_on_error<T: Default>(notice: &OnceCell<()>, err: InstrumentationError) -> T {
    match err {
        InstrumentationError::CapabilityUnavailable(_) => note_unavailable(notice, &err),
        other => debug!("Resource reading failed: {}", other),
    }
    T::default()
}
