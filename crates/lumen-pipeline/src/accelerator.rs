//! Hardware accelerator abstraction.
//!
//! The pipeline treats the accelerator as a device with its own memory
//! pool: buffers are allocated, uploaded, processed by kernels, and
//! copied back. Commands may be queued; [`Accelerator::events_flush`]
//! reports whether anything queued since the last reset failed.
//!
//! [`EmulatedDevice`] runs kernels on the host against a byte budget
//! and can inject faults, so the offload paths can be exercised without
//! hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::AcceleratorError;

/// Handle to a device-resident buffer of `len` floats.
///
/// Not `Clone`: a handle is released exactly once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    /// Number of floats held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opaque buffer id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// A kernel run inside [`Accelerator::dispatch`] on device memory.
pub type Kernel<'a> = dyn FnMut(&[f32], &mut [f32]) -> Result<(), AcceleratorError> + 'a;

/// A compute device with its own memory.
pub trait Accelerator: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Block until the device is free and claim it. Returns `false` if
    /// the device cannot be used at all.
    fn lock(&self) -> bool;

    /// Release a device claimed with [`lock`](Self::lock).
    fn unlock(&self);

    /// Bytes of device memory a single stage may use.
    fn memory_budget(&self) -> usize;

    /// Allocate an uninitialized buffer of `len` floats.
    ///
    /// # Errors
    ///
    /// Fails when the device is out of memory.
    fn alloc(&self, len: usize) -> Result<DeviceBuffer, AcceleratorError>;

    /// Copy host data into a new device buffer.
    ///
    /// # Errors
    ///
    /// Fails on allocation or transfer errors.
    fn upload(&self, host: &[f32]) -> Result<DeviceBuffer, AcceleratorError>;

    /// Copy a device buffer into `host`.
    ///
    /// # Errors
    ///
    /// Fails on transfer errors.
    fn download(&self, buffer: &DeviceBuffer, host: &mut [f32]) -> Result<(), AcceleratorError>;

    /// Free a device buffer.
    fn release(&self, buffer: DeviceBuffer);

    /// Run `kernel` with `input` readable and `output` writable.
    ///
    /// # Errors
    ///
    /// Propagates kernel failures and unknown handles.
    fn dispatch(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        kernel: &mut Kernel<'_>,
    ) -> Result<(), AcceleratorError>;

    /// Start a new batch of queued commands.
    fn events_reset(&self);

    /// Wait for queued commands and report whether any failed.
    ///
    /// # Errors
    ///
    /// Returns [`AcceleratorError::Queue`] if a queued command failed.
    fn events_flush(&self) -> Result<(), AcceleratorError>;
}

/// Which operations an [`EmulatedDevice`] should fail.
///
/// Counters fire on the n-th call (1-based) of each operation, counted
/// from device creation; `None` never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultPlan {
    /// Fail this upload.
    pub upload: Option<u64>,
    /// Fail this download.
    pub download: Option<u64>,
    /// Fail this kernel dispatch.
    pub kernel: Option<u64>,
    /// Fail this events flush.
    pub events_flush: Option<u64>,
    /// Report the device as unusable.
    pub unavailable: bool,
}

/// Per-operation counts, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounters {
    /// Uploads attempted.
    pub uploads: u64,
    /// Downloads attempted.
    pub downloads: u64,
    /// Kernel dispatches attempted.
    pub dispatches: u64,
    /// Events flushes attempted.
    pub flushes: u64,
    /// Buffers currently allocated.
    pub live_buffers: usize,
}

#[derive(Debug, Default)]
struct DeviceState {
    buffers: HashMap<u64, Vec<f32>>,
    used_bytes: usize,
    locked: bool,
    counters: DeviceCounters,
}

/// Host-backed accelerator with a memory budget and fault injection.
#[derive(Debug)]
pub struct EmulatedDevice {
    name: String,
    budget: usize,
    faults: FaultPlan,
    next_id: AtomicU64,
    state: Mutex<DeviceState>,
    released: Condvar,
}

impl EmulatedDevice {
    /// A device with `budget` bytes of memory and no faults.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self::with_faults(budget, FaultPlan::default())
    }

    /// A device that fails the operations named in `faults`.
    #[must_use]
    pub fn with_faults(budget: usize, faults: FaultPlan) -> Self {
        Self {
            name: "emulated".to_owned(),
            budget,
            faults,
            next_id: AtomicU64::new(1),
            state: Mutex::new(DeviceState::default()),
            released: Condvar::new(),
        }
    }

    /// Snapshot the operation counters.
    #[must_use]
    pub fn counters(&self) -> DeviceCounters {
        let state = self.lock_state();
        let mut counters = state.counters.clone();
        counters.live_buffers = state.buffers.len();
        counters
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, state: &mut DeviceState, data: Vec<f32>) -> Result<DeviceBuffer, AcceleratorError> {
        let bytes = data.len() * std::mem::size_of::<f32>();
        let available = self.budget.saturating_sub(state.used_bytes);
        if bytes > available {
            return Err(AcceleratorError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let len = data.len();
        state.used_bytes += bytes;
        state.buffers.insert(id, data);
        trace!(id, len, "device alloc");
        Ok(DeviceBuffer { id, len })
    }
}

fn fires(plan: Option<u64>, count: u64) -> bool {
    plan == Some(count)
}

impl Accelerator for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> bool {
        if self.faults.unavailable {
            return false;
        }
        let mut state = self.lock_state();
        while state.locked {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.locked = true;
        true
    }

    fn unlock(&self) {
        self.lock_state().locked = false;
        self.released.notify_one();
    }

    fn memory_budget(&self) -> usize {
        self.budget
    }

    fn alloc(&self, len: usize) -> Result<DeviceBuffer, AcceleratorError> {
        let mut state = self.lock_state();
        self.insert(&mut state, vec![0.0; len])
    }

    fn upload(&self, host: &[f32]) -> Result<DeviceBuffer, AcceleratorError> {
        let mut state = self.lock_state();
        state.counters.uploads += 1;
        if fires(self.faults.upload, state.counters.uploads) {
            return Err(AcceleratorError::Transfer("injected upload fault".to_owned()));
        }
        self.insert(&mut state, host.to_vec())
    }

    fn download(&self, buffer: &DeviceBuffer, host: &mut [f32]) -> Result<(), AcceleratorError> {
        let mut state = self.lock_state();
        state.counters.downloads += 1;
        if fires(self.faults.download, state.counters.downloads) {
            return Err(AcceleratorError::Transfer("injected download fault".to_owned()));
        }
        let data = state
            .buffers
            .get(&buffer.id)
            .ok_or(AcceleratorError::UnknownBuffer(buffer.id))?;
        let n = data.len().min(host.len());
        host[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn release(&self, buffer: DeviceBuffer) {
        let mut state = self.lock_state();
        if let Some(data) = state.buffers.remove(&buffer.id) {
            state.used_bytes -= data.len() * std::mem::size_of::<f32>();
            trace!(id = buffer.id, "device release");
        }
    }

    fn dispatch(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        kernel: &mut Kernel<'_>,
    ) -> Result<(), AcceleratorError> {
        let mut state = self.lock_state();
        state.counters.dispatches += 1;
        if fires(self.faults.kernel, state.counters.dispatches) {
            debug!("injected kernel fault");
            return Err(AcceleratorError::Kernel("injected kernel fault".to_owned()));
        }
        let mut out = state
            .buffers
            .remove(&output.id)
            .ok_or(AcceleratorError::UnknownBuffer(output.id))?;
        let result = match state.buffers.get(&input.id) {
            Some(inp) => kernel(inp, &mut out),
            None => Err(AcceleratorError::UnknownBuffer(input.id)),
        };
        state.buffers.insert(output.id, out);
        result
    }

    fn events_reset(&self) {}

    fn events_flush(&self) -> Result<(), AcceleratorError> {
        let mut state = self.lock_state();
        state.counters.flushes += 1;
        if fires(self.faults.events_flush, state.counters.flushes) {
            return Err(AcceleratorError::Queue);
        }
        Ok(())
    }
}
