use std::collections::{HashMap, HashSet};

use bincode::{Decode, Encode};
use parking_lot::RwLock;

use crate::common::config::{LeafId, RESERVED_RECORD_ID, RecordId};
use crate::common::exception::IndexingError;
use crate::query::index_query::IndexQuery;

/// Where one persisted record lives inside its data container. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct StorageDescriptor {
    pub id: RecordId,
    pub leaf_id: LeafId,
    pub offset: u64,
    pub length: u64,
}

/// Id-keyed leaf without ordering guarantees.
pub struct IdLeaf {
    id: LeafId,
    entries: RwLock<HashMap<RecordId, StorageDescriptor>>,
}

/// Leaf preserving insertion order, for records that form call trees.
pub struct OrderedLeaf {
    id: LeafId,
    state: RwLock<OrderedEntries>,
}

#[derive(Default)]
struct OrderedEntries {
    order: Vec<StorageDescriptor>,
    ids: HashSet<RecordId>,
}

pub enum StorageLeaf {
    ById(IdLeaf),
    Ordered(OrderedLeaf),
}

impl StorageLeaf {
    pub fn by_id(id: LeafId) -> Self {
        StorageLeaf::ById(IdLeaf {
            id,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn ordered(id: LeafId) -> Self {
        StorageLeaf::Ordered(OrderedLeaf {
            id,
            state: RwLock::new(OrderedEntries::default()),
        })
    }

    pub fn id(&self) -> LeafId {
        match self {
            StorageLeaf::ById(leaf) => leaf.id,
            StorageLeaf::Ordered(leaf) => leaf.id,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, StorageLeaf::Ordered(_))
    }

    /// Adds an entry for `id`. Ids are unique per leaf and `0` is rejected.
    pub fn put(&self, id: RecordId, offset: u64, length: u64) -> Result<StorageDescriptor, IndexingError> {
        if id == RESERVED_RECORD_ID {
            return Err(IndexingError::InvalidId);
        }
        let descriptor = StorageDescriptor {
            id,
            leaf_id: self.id(),
            offset,
            length,
        };
        match self {
            StorageLeaf::ById(leaf) => {
                let mut entries = leaf.entries.write();
                if entries.contains_key(&id) {
                    return Err(IndexingError::AlreadyIndexed(id));
                }
                entries.insert(id, descriptor);
            }
            StorageLeaf::Ordered(leaf) => {
                let mut state = leaf.state.write();
                if !state.ids.insert(id) {
                    return Err(IndexingError::AlreadyIndexed(id));
                }
                state.order.push(descriptor);
            }
        }
        Ok(descriptor)
    }

    pub fn get(&self, id: RecordId) -> Option<StorageDescriptor> {
        match self {
            StorageLeaf::ById(leaf) => leaf.entries.read().get(&id).copied(),
            StorageLeaf::Ordered(leaf) => {
                let state = leaf.state.read();
                if !state.ids.contains(&id) {
                    return None;
                }
                state.order.iter().find(|d| d.id == id).copied()
            }
        }
    }

    pub fn get_and_remove(&self, id: RecordId) -> Option<StorageDescriptor> {
        match self {
            StorageLeaf::ById(leaf) => leaf.entries.write().remove(&id),
            StorageLeaf::Ordered(leaf) => {
                let mut state = leaf.state.write();
                if !state.ids.remove(&id) {
                    return None;
                }
                let position = state.order.iter().position(|d| d.id == id)?;
                Some(state.order.remove(position))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StorageLeaf::ById(leaf) => leaf.entries.read().len(),
            StorageLeaf::Ordered(leaf) => leaf.state.read().order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries passing the query's id restrictions; insertion order for ordered leaves.
    pub fn query(&self, query: &IndexQuery, out: &mut Vec<StorageDescriptor>) {
        match self {
            StorageLeaf::ById(leaf) => out.extend(
                leaf.entries
                    .read()
                    .values()
                    .filter(|d| query.matches_id(d.id))
                    .copied(),
            ),
            StorageLeaf::Ordered(leaf) => out.extend(
                leaf.state
                    .read()
                    .order
                    .iter()
                    .filter(|d| query.matches_id(d.id))
                    .copied(),
            ),
        }
    }
}
