//! Reusable fixed-size I/O buffers.
//!
//! The pool tracks three quantities:
//!
//! ```text
//!   created      = available + outstanding          (≤ max_capacity)
//!   available    idle buffers ready for lease       (≤ min_capacity after releases)
//!   outstanding  buffers currently leased
//! ```
//!
//! `acquire` never waits: it reuses an idle buffer, allocates while `created` is below the
//! maximum, and otherwise fails with [`PoolError::Exhausted`]. Dropping a [`PooledBuffer`]
//! returns it; the buffer is kept idle only while fewer than `min_capacity` are idle,
//! otherwise it is freed and `created` shrinks. Steady-state memory therefore stays between
//! the two bounds instead of growing to the maximum and staying there.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

use crate::common::exception::PoolError;

/// Snapshot of pool occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub available: usize,
    pub outstanding: usize,
}

struct PoolInner {
    buffer_size: usize,
    max_capacity: usize,
    min_capacity: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn release(&self, data: Vec<u8>) {
        {
            let mut idle = self.idle.lock();
            if idle.len() < self.min_capacity {
                idle.push(data);
            } else {
                self.created.fetch_sub(1, Ordering::AcqRel);
                trace!("Dropped returned buffer, {} idle", idle.len());
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded pool of `buffer_size`-byte blocks. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, min_capacity: usize, max_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_capacity,
                min_capacity: min_capacity.min(max_capacity),
                idle: Mutex::new(Vec::with_capacity(min_capacity.min(max_capacity))),
                created: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity
    }

    pub fn min_capacity(&self) -> usize {
        self.inner.min_capacity
    }

    /// Leases a buffer without ever blocking.
    pub fn acquire(&self) -> Result<PooledBuffer, PoolError> {
        let reused = self.inner.idle.lock().pop();
        let data = match reused {
            Some(data) => data,
            None => {
                let max = self.inner.max_capacity;
                self.inner
                    .created
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                        (created < max).then_some(created + 1)
                    })
                    .map_err(|_| PoolError::Exhausted { max })?;
                vec![0; self.inner.buffer_size]
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledBuffer {
            data,
            len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Leases as many buffers as `bytes` needs and copies it in. Either every buffer is
    /// leased or none is.
    pub fn acquire_filled(&self, bytes: &[u8]) -> Result<Vec<PooledBuffer>, PoolError> {
        let mut buffers = self.acquire_many(self.buffers_for(bytes.len()))?;
        for (buffer, chunk) in buffers.iter_mut().zip(bytes.chunks(self.inner.buffer_size)) {
            buffer.fill_from(chunk);
        }
        Ok(buffers)
    }

    /// Leases `count` buffers, returning the ones already leased on failure.
    pub fn acquire_many(&self, count: usize) -> Result<Vec<PooledBuffer>, PoolError> {
        (0..count).map(|_| self.acquire()).collect()
    }

    /// Number of buffers needed to hold `len` bytes.
    pub fn buffers_for(&self, len: usize) -> usize {
        len.div_ceil(self.inner.buffer_size)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Acquire),
            available: self.inner.idle.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("min_capacity", &self.inner.min_capacity)
            .field("max_capacity", &self.inner.max_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Leased block. Its valid length starts at zero; returning happens on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the valid length, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Copies as much of `bytes` as fits and makes it the valid content.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}
