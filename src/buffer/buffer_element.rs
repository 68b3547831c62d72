use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::warn;

use crate::common::config::RecordId;
use crate::common::object_sizes::ObjectSizes;
use crate::types_db::record::Record;

/// Lifecycle of a chain element. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementState {
    Inserted = 0,
    Analyzed = 1,
    Indexed = 2,
    Evicted = 3,
}

impl ElementState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ElementState::Inserted,
            1 => ElementState::Analyzed,
            2 => ElementState::Indexed,
            _ => ElementState::Evicted,
        }
    }
}

/// Chain node wrapping one record. Owns the strong reference that keeps the record alive
/// while it is buffered and links forward to the next arrival.
pub struct BufferElement {
    record: Arc<Record>,
    next: OnceLock<Arc<BufferElement>>,
    size: AtomicU64,
    state: AtomicU8,
}

impl BufferElement {
    pub fn new(record: Arc<Record>) -> Self {
        Self {
            record,
            next: OnceLock::new(),
            size: AtomicU64::new(0),
            state: AtomicU8::new(ElementState::Inserted as u8),
        }
    }

    pub fn record(&self) -> &Arc<Record> {
        &self.record
    }

    pub fn id(&self) -> RecordId {
        self.record.id()
    }

    /// The chronologically next element, once linked.
    pub fn next(&self) -> Option<&Arc<BufferElement>> {
        self.next.get()
    }

    /// Links the successor. The chain never re-links an element, so a second call is a bug
    /// and is only logged.
    pub(crate) fn link_next(&self, next: Arc<BufferElement>) {
        if self.next.set(next).is_err() {
            warn!("Element {} already has a successor; link ignored", self.id());
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ElementState {
        ElementState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_analyzed(&self) -> bool {
        self.state() >= ElementState::Analyzed
    }

    pub fn is_evicted(&self) -> bool {
        self.state() == ElementState::Evicted
    }

    /// Computes and stores the footprint without changing state. Malformed records get a
    /// footprint of zero so analysis never stalls on them.
    pub(crate) fn compute_size(&self, sizes: &ObjectSizes) -> u64 {
        let size = match self.record.calculate_size(sizes) {
            Ok(size) => size,
            Err(e) => {
                warn!("Size of record {} set to 0: {}", self.id(), e);
                0
            }
        };
        self.size.store(size, Ordering::Release);
        size
    }

    /// Computes the footprint and moves to `Analyzed`. Does nothing for an element that
    /// is already analyzed and returns its stored size.
    pub fn calculate_and_set_size(&self, sizes: &ObjectSizes) -> u64 {
        if self.is_analyzed() {
            return self.size();
        }
        let size = self.compute_size(sizes);
        self.advance_state(ElementState::Analyzed);
        size
    }

    /// Moves to `target` if that is a forward transition. Returns whether the state changed.
    pub(crate) fn advance_state(&self, target: ElementState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < target as u8).then_some(target as u8)
            })
            .is_ok()
    }
}

impl fmt::Debug for BufferElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferElement")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("size", &self.size())
            .field("linked", &self.next.get().is_some())
            .finish()
    }
}

impl Drop for BufferElement {
    // Unlink iteratively; the default recursive drop overflows the stack on long chains.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(element) = next {
            match Arc::try_unwrap(element) {
                Ok(mut element) => next = element.next.take(),
                Err(_) => break,
            }
        }
    }
}
