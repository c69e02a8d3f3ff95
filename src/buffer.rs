//! Split stage record buffer.

use crate::monitor::{MemoryMonitor, MemoryProbe};

/// Buffer limited by both records count and process memory growth.
pub struct RunBuffer<T, P: MemoryProbe> {
    limit: usize,
    inner: Vec<T>,
    monitor: MemoryMonitor<P>,
    memory_exceeded: bool,
}

impl<T, P: MemoryProbe> RunBuffer<T, P> {
    /// Creates a buffer.
    ///
    /// # Arguments
    /// * `limit` - Maximum number of records in the buffer
    /// * `monitor` - Memory monitor deciding on memory based flushes
    pub fn new(limit: usize, monitor: MemoryMonitor<P>) -> Self {
        RunBuffer {
            limit: limit.max(1),
            inner: Vec::new(),
            monitor,
            memory_exceeded: false,
        }
    }

    /// Adds a new element to the buffer.
    pub fn push(&mut self, item: T) {
        self.inner.push(item);
        if self.monitor.record_added() {
            self.memory_exceeded = true;
        }
    }

    /// Returns buffer length.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the records limit or the memory monitor asked for a flush.
    pub fn is_full(&self) -> bool {
        self.memory_exceeded || self.inner.len() >= self.limit
    }

    /// Takes the buffered items and starts a new batch.
    ///
    /// The memory baseline is captured again after the previous batch is released by the caller, see
    /// [`RunBuffer::rebaseline`].
    pub fn take(&mut self) -> Vec<T> {
        self.memory_exceeded = false;
        std::mem::take(&mut self.inner)
    }

    /// Re-captures the memory baseline.
    pub fn rebaseline(&mut self) {
        self.monitor.rebaseline();
    }
}
