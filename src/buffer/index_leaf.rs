use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::config::{LeafId, RESERVED_RECORD_ID, RecordId};
use crate::common::exception::IndexingError;
use crate::query::index_query::IndexQuery;
use crate::types_db::record::Record;

struct LeafState {
    entries: HashMap<RecordId, Weak<Record>>,
    retired: bool,
}

impl LeafState {
    fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| record.strong_count() > 0);
        before - self.entries.len()
    }
}

/// Terminal node of the live index. Holds weak handles only: a record indexed here stays
/// alive exactly as long as the chain or an explicit holder keeps it.
///
/// Dead handles are detected by probing liveness, either eagerly in [`IndexLeaf::get`] or
/// in bulk by [`IndexLeaf::clean`].
pub struct IndexLeaf {
    id: LeafId,
    state: Mutex<LeafState>,
}

impl IndexLeaf {
    pub fn new(id: LeafId) -> Self {
        Self {
            id,
            state: Mutex::new(LeafState {
                entries: HashMap::new(),
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> LeafId {
        self.id
    }

    pub fn put(&self, record: &Arc<Record>) -> Result<(), IndexingError> {
        if record.id() == RESERVED_RECORD_ID {
            return Err(IndexingError::InvalidId);
        }
        let mut state = self.state.lock();
        if state.retired {
            return Err(IndexingError::Retired);
        }
        state.entries.insert(record.id(), Arc::downgrade(record));
        Ok(())
    }

    /// Returns the live record; a handle whose referent is gone is removed on the spot.
    pub fn get(&self, id: RecordId) -> Option<Arc<Record>> {
        let mut state = self.state.lock();
        let record = state.entries.get(&id)?.upgrade();
        if record.is_none() {
            state.entries.remove(&id);
        }
        record
    }

    pub fn get_and_remove(&self, id: RecordId) -> Option<Arc<Record>> {
        self.state.lock().entries.remove(&id)?.upgrade()
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|record| record.strong_count() > 0)
            .count()
    }

    /// Drops every dead handle and reports whether the leaf is now empty.
    pub fn clean(&self) -> bool {
        self.clean_counted().1
    }

    /// Like [`IndexLeaf::clean`], also returning how many handles were dropped.
    pub fn clean_counted(&self) -> (usize, bool) {
        let mut state = self.state.lock();
        let removed = state.sweep();
        (removed, state.entries.is_empty())
    }

    /// Marks the leaf unusable if it holds no live entry. Puts racing with the parent's
    /// pruning then fail with [`IndexingError::Retired`] and are retried from the root.
    pub(crate) fn try_retire(&self) -> bool {
        let mut state = self.state.lock();
        state.sweep();
        if state.entries.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    pub(crate) fn retire(&self) {
        let mut state = self.state.lock();
        state.retired = true;
        state.entries.clear();
    }

    pub(crate) fn collect(&self, query: &IndexQuery, out: &mut Vec<Arc<Record>>) {
        let live: Vec<Arc<Record>> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(id, _)| query.matches_id(**id))
                .filter_map(|(_, record)| record.upgrade())
                .collect()
        };
        // The predicate is user code; evaluate it without holding the leaf lock.
        out.extend(live.into_iter().filter(|record| query.matches(record)));
    }
}
