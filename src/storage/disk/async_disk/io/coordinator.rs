//! # Multi-part I/O Coordination
//!
//! One logical write or read may be split into N requests, one per pooled buffer. The
//! `IoCoordinator` counts their completions and runs the caller's continuation exactly once,
//! when the Nth request finishes, whether or not any of them failed.
//!
//! ```text
//!   write_all([b0, b1, b2])
//!        │
//!        ▼
//!   IoCoordinator { expected: 3 }
//!        │
//!        ├── request 0 ──▶ mark_success ──┐
//!        ├── request 1 ──▶ mark_failed  ──┼──▶ completed == 3 ──▶ continuation(IoOutcome)
//!        └── request 2 ──▶ mark_success ──┘                       { succeeded: 2, failed: 1 }
//! ```
//!
//! Requests complete on runtime worker threads in any order; the outcome lists parts
//! sorted by their index so readers can reassemble buffers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::error;
use parking_lot::Mutex;

use crate::storage::disk::async_disk::memory::memory_pool::PooledBuffer;

pub type Continuation = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// Completion record of one constituent request.
#[derive(Debug)]
pub struct PartOutcome {
    pub index: usize,
    pub offset: u64,
    pub len: usize,
    /// Filled buffer of a successful read; writes hand their buffer back to the pool.
    pub buffer: Option<PooledBuffer>,
    pub error: Option<String>,
}

impl PartOutcome {
    pub fn new(index: usize, offset: u64, len: usize) -> Self {
        Self {
            index,
            offset,
            len,
            buffer: None,
            error: None,
        }
    }

    pub fn with_buffer(mut self, buffer: PooledBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate handed to the continuation.
#[derive(Debug, Default)]
pub struct IoOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub parts: Vec<PartOutcome>,
}

impl IoOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Lowest offset touched by the operation.
    pub fn position(&self) -> Option<u64> {
        self.parts.iter().map(|part| part.offset).min()
    }

    /// Total bytes the operation covered.
    pub fn length(&self) -> u64 {
        self.parts.iter().map(|part| part.len as u64).sum()
    }

    pub fn first_error(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| part.error.as_deref())
    }

    /// Concatenates the buffers of every part in index order.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length() as usize);
        for part in &self.parts {
            if let Some(buffer) = &part.buffer {
                bytes.extend_from_slice(buffer.as_slice());
            }
        }
        bytes
    }
}

pub struct IoCoordinator {
    expected: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    completed: AtomicUsize,
    parts: Mutex<Vec<PartOutcome>>,
    continuation: Mutex<Option<Continuation>>,
}

impl IoCoordinator {
    /// Coordinator for `expected` constituents. With zero constituents the continuation
    /// runs immediately.
    pub fn new<F>(expected: usize, continuation: F) -> Arc<Self>
    where
        F: FnOnce(IoOutcome) + Send + 'static,
    {
        let coordinator = Arc::new(Self {
            expected,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            parts: Mutex::new(Vec::with_capacity(expected)),
            continuation: Mutex::new(Some(Box::new(continuation))),
        });
        if expected == 0 {
            coordinator.fire();
        }
        coordinator
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.completed() >= self.expected
    }

    pub fn mark_success(&self, part: PartOutcome) {
        self.succeeded.fetch_add(1, Ordering::AcqRel);
        self.finish(part);
    }

    pub fn mark_failed(&self, mut part: PartOutcome, error: &dyn fmt::Display) {
        error!("I/O at offset {} ({} bytes) failed: {}", part.offset, part.len, error);
        part.error = Some(error.to_string());
        part.buffer = None;
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.finish(part);
    }

    fn finish(&self, part: PartOutcome) {
        self.parts.lock().push(part);
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.expected {
            self.fire();
        } else if done > self.expected {
            error!("Coordinator expected {} completions, got {}", self.expected, done);
        }
    }

    fn fire(&self) {
        let Some(continuation) = self.continuation.lock().take() else {
            return;
        };
        let mut parts = std::mem::take(&mut *self.parts.lock());
        parts.sort_by_key(|part| part.index);
        continuation(IoOutcome {
            succeeded: self.succeeded(),
            failed: self.failed(),
            parts,
        });
    }
}

impl fmt::Debug for IoCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCoordinator")
            .field("expected", &self.expected)
            .field("succeeded", &self.succeeded())
            .field("failed", &self.failed())
            .finish()
    }
}
