//! Storage-side index: the on-disk analogue of the live index tree.
//!
//! Branches classify with the same [`BranchIndexer`] scheme as the live tree, so a record
//! lands under the same key path in both. Leaves map ids to [`StorageDescriptor`]s; the
//! first record to reach a new leaf decides its variant, ordered for hierarchical records
//! and id-keyed otherwise. With the default storage layout the record kind is the top level,
//! so a leaf never mixes the two.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::exception::IndexingError;
use crate::query::index_query::IndexQuery;
use crate::storage::index::branch_indexer::BranchIndexer;
use crate::storage::index::indexer::IndexKey;
use crate::storage::index::storage_leaf::{StorageDescriptor, StorageLeaf};
use crate::types_db::record::RecordHeader;

pub enum StorageComponent {
    Branch(StorageBranch),
    Leaf(StorageLeaf),
}

impl StorageComponent {
    pub fn as_branch(&self) -> Option<&StorageBranch> {
        match self {
            StorageComponent::Branch(branch) => Some(branch),
            StorageComponent::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&StorageLeaf> {
        match self {
            StorageComponent::Leaf(leaf) => Some(leaf),
            StorageComponent::Branch(_) => None,
        }
    }

    fn query(&self, query: &IndexQuery, out: &mut Vec<StorageDescriptor>) {
        match self {
            StorageComponent::Branch(branch) => {
                for child in branch.children_for(query) {
                    child.query(query, out);
                }
            }
            StorageComponent::Leaf(leaf) => leaf.query(query, out),
        }
    }

    fn visit_leaves(&self, visit: &mut dyn FnMut(&StorageLeaf)) {
        match self {
            StorageComponent::Branch(branch) => {
                for child in branch.children.read().values() {
                    child.visit_leaves(visit);
                }
            }
            StorageComponent::Leaf(leaf) => visit(leaf),
        }
    }
}

pub struct StorageBranch {
    indexer: Arc<BranchIndexer>,
    children: RwLock<HashMap<IndexKey, Arc<StorageComponent>>>,
}

impl StorageBranch {
    pub fn new(indexer: Arc<BranchIndexer>) -> Self {
        Self {
            indexer,
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn indexer(&self) -> &Arc<BranchIndexer> {
        &self.indexer
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Returns the child a record classifies into, creating it on first touch.
    pub fn get_next_component(&self, header: &RecordHeader) -> Arc<StorageComponent> {
        let key = self.indexer.indexer().key(header);
        if let Some(child) = self.children.read().get(&key) {
            return Arc::clone(child);
        }
        let mut children = self.children.write();
        let child = children
            .entry(key)
            .or_insert_with(|| Arc::new(self.create_child(header)));
        Arc::clone(child)
    }

    fn existing_child(&self, header: &RecordHeader) -> Option<Arc<StorageComponent>> {
        let key = self.indexer.indexer().key(header);
        self.children.read().get(&key).cloned()
    }

    fn create_child(&self, header: &RecordHeader) -> StorageComponent {
        match self.indexer.next_indexer() {
            Some(indexer) => StorageComponent::Branch(StorageBranch::new(indexer)),
            None if header.kind.is_hierarchical() => StorageComponent::Leaf(StorageLeaf::ordered(self.indexer.leaf_id())),
            None => StorageComponent::Leaf(StorageLeaf::by_id(self.indexer.leaf_id())),
        }
    }

    fn children_for(&self, query: &IndexQuery) -> Vec<Arc<StorageComponent>> {
        let children = self.children.read();
        match self.indexer.indexer().keys(query) {
            Some(keys) => keys.iter().filter_map(|key| children.get(key).cloned()).collect(),
            None => children.values().cloned().collect(),
        }
    }
}

pub struct PersistentIndexTree {
    root: StorageBranch,
}

impl PersistentIndexTree {
    pub fn new(indexer: BranchIndexer) -> Self {
        Self {
            root: StorageBranch::new(Arc::new(indexer)),
        }
    }

    pub fn root(&self) -> &StorageBranch {
        &self.root
    }

    fn leaf_for(&self, header: &RecordHeader) -> Arc<StorageComponent> {
        let mut node = self.root.get_next_component(header);
        while let StorageComponent::Branch(branch) = node.as_ref() {
            let next = branch.get_next_component(header);
            node = next;
        }
        node
    }

    fn existing_leaf(&self, header: &RecordHeader) -> Option<Arc<StorageComponent>> {
        let mut node = self.root.existing_child(header)?;
        while let StorageComponent::Branch(branch) = node.as_ref() {
            let next = branch.existing_child(header)?;
            node = next;
        }
        Some(node)
    }

    /// Records where a persisted record landed.
    pub fn put(&self, header: &RecordHeader, offset: u64, length: u64) -> Result<StorageDescriptor, IndexingError> {
        let node = self.leaf_for(header);
        match node.as_leaf() {
            Some(leaf) => leaf.put(header.id, offset, length),
            None => Err(IndexingError::Retired),
        }
    }

    pub fn get(&self, header: &RecordHeader) -> Option<StorageDescriptor> {
        self.existing_leaf(header)?.as_leaf()?.get(header.id)
    }

    pub fn get_and_remove(&self, header: &RecordHeader) -> Option<StorageDescriptor> {
        self.existing_leaf(header)?.as_leaf()?.get_and_remove(header.id)
    }

    /// Searches every leaf for `id`; use [`PersistentIndexTree::get`] when the header is known.
    pub fn find(&self, id: u64) -> Option<StorageDescriptor> {
        let mut found = None;
        for child in self.root.children.read().values() {
            child.visit_leaves(&mut |leaf| {
                if found.is_none() {
                    found = leaf.get(id);
                }
            });
        }
        found
    }

    pub fn query(&self, query: &IndexQuery) -> Vec<StorageDescriptor> {
        let mut out = Vec::new();
        for child in self.root.children_for(query) {
            child.query(query, &mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        let mut total = 0;
        for child in self.root.children.read().values() {
            child.visit_leaves(&mut |leaf| total += leaf.len());
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leaf_count(&self) -> usize {
        let mut leaves = 0;
        for child in self.root.children.read().values() {
            child.visit_leaves(&mut |_| leaves += 1);
        }
        leaves
    }
}
