//! Accelerator Memory Counters
//!
//! Peak-since-reset memory tracking for GPU-class devices. The hook only
//! needs two operations, so any device runtime can be plugged in by
//! implementing [`AcceleratorMemory`].

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::InstrumentationError;

/// Peak allocation counter of an accelerator device.
pub trait AcceleratorMemory: Send + Sync {
    /// Maximum bytes allocated since the last [`reset_peak`](Self::reset_peak).
    fn peak_allocated(&self) -> Result<u64, InstrumentationError>;

    /// Sets the peak back to the current allocation level.
    fn reset_peak(&self);

    /// Whether a device is actually present.
    fn is_available(&self) -> bool {
        true
    }
}

/// Stand-in used when no accelerator device exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccelerator;

impl AcceleratorMemory for NullAccelerator {
    fn peak_allocated(&self) -> Result<u64, InstrumentationError> {
        Err(InstrumentationError::CapabilityUnavailable("accelerator device"))
    }

    fn reset_peak(&self) {}

    fn is_available(&self) -> bool {
        false
    }
}

/// Allocation counter fed by the host's own device allocator.
///
/// # Example
///
/// ```
/// use exectime::monitoring::{AcceleratorMemory, TrackedAccelerator};
///
/// let device = TrackedAccelerator::new();
/// device.record_alloc(4096);
/// device.record_free(4096);
/// assert_eq!(device.peak_allocated().unwrap(), 4096);
///
/// device.reset_peak();
/// assert_eq!(device.peak_allocated().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct TrackedAccelerator {
    allocated: AtomicI64,
    peak: AtomicI64,
}

impl TrackedAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an allocation of `bytes` on the device.
    pub fn record_alloc(&self, bytes: u64) {
        let now = self.allocated.fetch_add(bytes as i64, Ordering::SeqCst) + bytes as i64;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Records a release of `bytes` on the device.
    pub fn record_free(&self, bytes: u64) {
        self.allocated.fetch_sub(bytes as i64, Ordering::SeqCst);
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst).max(0) as u64
    }
}

impl AcceleratorMemory for TrackedAccelerator {
    fn peak_allocated(&self) -> Result<u64, InstrumentationError> {
        Ok(self.peak.load(Ordering::SeqCst).max(0) as u64)
    }

    fn reset_peak(&self) {
        self.peak
            .store(self.allocated.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}
