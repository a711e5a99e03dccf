//! Reusable value buffers for session handles
//!
//! Every handle owns one value map. Maps are taken from the pool when a handle
//! is built and given back when it is dropped or released, so a busy server
//! does not allocate a fresh map per request.

use kvsession_core::SessionValues;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maps that grew past this many slots are dropped rather than kept idle
const MAX_RETAINED_SLOTS: usize = 256;

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers created because the pool was empty
    pub allocated: u64,
    /// Buffers handed out again after a release
    pub reused: u64,
    /// Buffers returned by handles
    pub released: u64,
    /// Buffers currently waiting for reuse
    pub idle: usize,
}

/// Bounded pool of cleared value maps
#[derive(Debug)]
pub struct HandlePool {
    idle: Mutex<Vec<SessionValues>>,
    capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

impl HandlePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity.min(MAX_RETAINED_SLOTS))),
            capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Take an empty buffer, reusing an idle one when available
    pub fn acquire(&self) -> SessionValues {
        match self.idle.lock().pop() {
            Some(values) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                values
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                SessionValues::new()
            }
        }
    }

    /// Adopt a freshly decoded map as a handle buffer. Idle buffers are left
    /// for empty sessions; the map joins the pool once released.
    pub fn acquire_with(&self, initial: SessionValues) -> SessionValues {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        initial
    }

    /// Clear a buffer and keep it if there is room
    pub fn release(&self, mut values: SessionValues) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if values.capacity() > MAX_RETAINED_SLOTS {
            return;
        }
        values.clear();

        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(values);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}
