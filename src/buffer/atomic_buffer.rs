//! # Record Chain
//!
//! `AtomicBuffer` is the arrival-ordered, append-only log of ingested records. It owns the
//! only strong references the data plane keeps; the index tree refers to records weakly.
//!
//! ```text
//!   oldest                    analysis cursor                      newest
//!     │                             │                                 │
//!     ▼                             ▼                                 ▼
//!   ┌─────┐   ┌─────┐   ┌─────┐   ┌─────┐   ┌─────┐   ┌─────┐   ┌─────┐
//!   │  1  │──▶│  2  │──▶│  3  │──▶│  4  │──▶│  5  │──▶│  6  │──▶│  7  │
//!   └─────┘   └─────┘   └─────┘   └─────┘   └─────┘   └─────┘   └─────┘
//!   INDEXED   INDEXED   INDEXED   INDEXED   INSERTED  INSERTED  INSERTED
//!   ◀───── eviction window ─────▶
//! ```
//!
//! * Producers append concurrently: one atomic swap of `newest`, then the previous tail is
//!   linked forward. A reader may briefly see the previous tail without its successor.
//! * One analyzer advances the cursor, computes footprints and indexes records.
//! * Eviction moves `oldest` forward over analyzed elements once the computed footprint
//!   exceeds the occupancy threshold. Elements dropped from the front release their record,
//!   which the evictor later sweeps from the index. Eviction never passes an unanalyzed
//!   element and never detaches the newest one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::buffer_element::{BufferElement, ElementState};
use crate::buffer::index_tree::IndexTree;
use crate::common::config::DataPlaneConfig;
use crate::common::object_sizes::ObjectSizes;
use crate::types_db::record::Record;

/// Counters exposed for monitoring and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub elements_added: u64,
    pub elements_analyzed: u64,
    pub elements_indexed: u64,
    pub elements_evicted: u64,
    pub current_size: u64,
    pub max_size: u64,
}

/// Outcome of one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPass {
    pub elements: u64,
    pub bytes: u64,
}

pub struct AtomicBuffer {
    newest: ArcSwapOption<BufferElement>,
    oldest: ArcSwapOption<BufferElement>,
    /// Last element handed to the analyzer.
    cursor: Mutex<Option<Arc<BufferElement>>>,
    index_tree: Arc<IndexTree>,
    object_sizes: ObjectSizes,
    max_size: AtomicU64,
    eviction_occupancy: f32,
    eviction_fragment: f32,
    current_size: AtomicU64,
    elements_added: AtomicU64,
    elements_analyzed: AtomicU64,
    elements_indexed: AtomicU64,
    elements_evicted: AtomicU64,
    eviction_lock: Mutex<()>,
    arrivals: Mutex<()>,
    arrival_signal: Condvar,
    /// Set while the analyzer is parked on `arrival_signal`.
    parked: AtomicBool,
}

impl AtomicBuffer {
    pub fn new(config: &DataPlaneConfig, index_tree: Arc<IndexTree>) -> Self {
        Self {
            newest: ArcSwapOption::empty(),
            oldest: ArcSwapOption::empty(),
            cursor: Mutex::new(None),
            index_tree,
            object_sizes: ObjectSizes::new(config.object_expansion_rate),
            max_size: AtomicU64::new(config.buffer_max_size),
            eviction_occupancy: config.eviction_occupancy_percentage,
            eviction_fragment: config.eviction_fragment_size_percentage,
            current_size: AtomicU64::new(0),
            elements_added: AtomicU64::new(0),
            elements_analyzed: AtomicU64::new(0),
            elements_indexed: AtomicU64::new(0),
            elements_evicted: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            arrivals: Mutex::new(()),
            arrival_signal: Condvar::new(),
            parked: AtomicBool::new(false),
        }
    }

    pub fn index_tree(&self) -> &Arc<IndexTree> {
        &self.index_tree
    }

    /// Appends a record at the tail. Never blocks on anything but the atomic swap, unless
    /// the analyzer is parked and has to be woken.
    pub fn append(&self, record: Arc<Record>) -> Arc<BufferElement> {
        let element = Arc::new(BufferElement::new(record));
        match self.newest.swap(Some(Arc::clone(&element))) {
            Some(previous) => previous.link_next(Arc::clone(&element)),
            None => self.oldest.store(Some(Arc::clone(&element))),
        }
        self.elements_added.fetch_add(1, Ordering::Relaxed);
        // Pairs with the fence in `wait_for_arrivals`: either the waiter sees this element or
        // this producer sees the waiter parked.
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::Relaxed) {
            let _guard = self.arrivals.lock();
            self.arrival_signal.notify_one();
        }
        element
    }

    pub fn oldest(&self) -> Option<Arc<BufferElement>> {
        self.oldest.load_full()
    }

    pub fn newest(&self) -> Option<Arc<BufferElement>> {
        self.newest.load_full()
    }

    /// Iterates the chain from the oldest buffered element onwards.
    pub fn iter(&self) -> ChainIter {
        ChainIter { next: self.oldest() }
    }

    fn next_to_analyze(&self, cursor: &Option<Arc<BufferElement>>) -> Option<Arc<BufferElement>> {
        match cursor {
            Some(last) => last.next().cloned(),
            None => self.oldest(),
        }
    }

    pub fn has_pending(&self) -> bool {
        let cursor = self.cursor.lock();
        self.next_to_analyze(&cursor).is_some()
    }

    /// Analyzes the element after the cursor: computes its footprint, indexes it and
    /// advances the cursor. Returns `false` when nothing is waiting.
    pub fn analyze_next(&self) -> bool {
        let mut cursor = self.cursor.lock();
        let Some(element) = self.next_to_analyze(&cursor) else {
            return false;
        };

        if !element.is_analyzed() {
            let size = element.compute_size(&self.object_sizes);
            // Account before publishing `Analyzed`, eviction subtracts only analyzed sizes.
            self.current_size.fetch_add(size, Ordering::AcqRel);
            element.advance_state(ElementState::Analyzed);
            self.elements_analyzed.fetch_add(1, Ordering::Relaxed);

            match self.index_tree.put(element.record()) {
                Ok(()) => {
                    if element.advance_state(ElementState::Indexed) {
                        self.elements_indexed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => warn!("Record {} left unindexed: {}", element.id(), e),
            }
        }

        *cursor = Some(element);
        true
    }

    /// Analyzes everything currently waiting. Returns how many elements were processed.
    pub fn analyze_pending(&self) -> usize {
        let mut processed = 0;
        while self.analyze_next() {
            processed += 1;
        }
        processed
    }

    /// Parks the caller until a new arrival is signalled or `timeout` elapses.
    pub fn wait_for_arrivals(&self, timeout: Duration) {
        let mut guard = self.arrivals.lock();
        self.parked.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if !self.has_pending() {
            self.arrival_signal.wait_for(&mut guard, timeout);
        }
        self.parked.store(false, Ordering::Relaxed);
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    pub fn occupancy(&self) -> f32 {
        match self.max_size() {
            0 => 1.0,
            max => self.current_size() as f32 / max as f32,
        }
    }

    pub fn should_evict(&self) -> bool {
        self.current_size() as f64 > self.max_size() as f64 * f64::from(self.eviction_occupancy)
    }

    /// Evicts one fragment from the oldest end when occupancy is above the threshold.
    pub fn evict(&self) -> EvictionPass {
        let _guard = self.eviction_lock.lock();
        if !self.should_evict() {
            return EvictionPass::default();
        }

        let target = (self.max_size() as f64 * f64::from(self.eviction_fragment)) as u64;
        let mut pass = EvictionPass::default();
        let mut front = self.oldest();

        while pass.bytes < target.max(1) {
            let Some(element) = front.as_ref() else { break };
            if !element.is_analyzed() {
                break;
            }
            let Some(next) = element.next().cloned() else { break };
            element.advance_state(ElementState::Evicted);
            pass.bytes += element.size();
            pass.elements += 1;
            front = Some(next);
        }

        if pass.elements > 0 {
            self.oldest.store(front);
            self.subtract_size(pass.bytes);
            self.elements_evicted.fetch_add(pass.elements, Ordering::Relaxed);
            debug!(
                "Evicted {} elements ({} bytes), occupancy now {:.2}",
                pass.elements,
                pass.bytes,
                self.occupancy()
            );
        }
        pass
    }

    fn subtract_size(&self, bytes: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| Some(size.saturating_sub(bytes)));
    }

    /// Drops every buffered element and empties the index. Producers appending at the same
    /// time may land in the fresh chain or be dropped with the old one.
    pub fn clear_all(&self) {
        let _guard = self.eviction_lock.lock();
        let mut cursor = self.cursor.lock();
        self.newest.store(None);
        self.oldest.store(None);
        *cursor = None;
        self.current_size.store(0, Ordering::Release);
        self.index_tree.clear();
        info!("Record chain cleared");
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            elements_added: self.elements_added.load(Ordering::Relaxed),
            elements_analyzed: self.elements_analyzed.load(Ordering::Relaxed),
            elements_indexed: self.elements_indexed.load(Ordering::Relaxed),
            elements_evicted: self.elements_evicted.load(Ordering::Relaxed),
            current_size: self.current_size(),
            max_size: self.max_size(),
        }
    }
}

pub struct ChainIter {
    next: Option<Arc<BufferElement>>,
}

impl Iterator for ChainIter {
    type Item = Arc<BufferElement>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next().cloned();
        Some(current)
    }
}
