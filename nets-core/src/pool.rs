//! Pooled byte buffers.
//!
//! Read buffers are fixed-size `Vec<u8>` slabs handed to the socket read;
//! accumulators are growable `BytesMut` values that hold received bytes until
//! the application drains them. Both kinds are recycled through bounded
//! idle lists so steady-state traffic does not allocate.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default read buffer capacity (4 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Default number of idle buffers retained per kind.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Accumulators that grew beyond this many read buffers' worth of capacity
/// are freed rather than kept idle.
pub const ACCUMULATOR_RETAIN_FACTOR: usize = 16;

/// A pool of equally-sized read buffers and reusable accumulators.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    max_idle: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    accumulators: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `capacity` bytes.
    ///
    /// A capacity of zero is raised to one so reads always make progress.
    pub fn new(capacity: usize) -> Self {
        Self::with_max_idle(capacity, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(capacity: usize, max_idle: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_idle,
            buffers: Mutex::new(Vec::new()),
            accumulators: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    /// Largest accumulator capacity kept for reuse.
    pub fn max_accumulator(&self) -> usize {
        self.capacity.saturating_mul(ACCUMULATOR_RETAIN_FACTOR)
    }

    /// Returns a buffer whose length and capacity both equal the pool
    /// capacity. Recycled buffers keep their previous contents.
    pub fn get(&self) -> Vec<u8> {
        match self.buffers.lock().pop() {
            Some(buf) => buf,
            None => vec![0; self.capacity],
        }
    }

    /// Returns a buffer to the pool.
    ///
    /// Buffers whose length or capacity differ from the pool capacity are
    /// dropped, as are buffers beyond the idle limit.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.capacity || buf.capacity() != self.capacity {
            return;
        }
        let mut idle = self.buffers.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// Returns an empty accumulator with at least the pool capacity reserved.
    pub fn get_accumulator(&self) -> BytesMut {
        match self.accumulators.lock().pop() {
            Some(acc) => acc,
            None => BytesMut::with_capacity(self.capacity),
        }
    }

    /// Returns an accumulator to the pool. Its contents are discarded.
    ///
    /// Accumulators larger than [`max_accumulator`](BufferPool::max_accumulator)
    /// are dropped so one burst of unread data does not stay pinned.
    pub fn put_accumulator(&self, mut acc: BytesMut) {
        if acc.capacity() > self.max_accumulator() {
            return;
        }
        acc.clear();
        let mut idle = self.accumulators.lock();
        if idle.len() < self.max_idle {
            idle.push(acc);
        }
    }

    /// Number of idle read buffers.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of idle accumulators.
    pub fn idle_accumulators(&self) -> usize {
        self.accumulators.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
