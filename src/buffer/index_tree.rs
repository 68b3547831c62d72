//! # Live Index Tree
//!
//! In-memory classification of analyzed records. Branches route a record by the key their
//! indexer derives from its header; leaves hold weak handles keyed by record id.
//!
//! ```text
//!                         IndexTree (root branch, never pruned)
//!                          platform indexer
//!                 ┌────────────┴─────────────┐
//!            Ident(1)                     Ident(2)
//!          kind branch                  kind branch
//!         ┌─────┴──────┐                    │
//!     Kind(Timer)  Kind(Sql)           Kind(Timer)
//!      time branch  time branch         time branch
//!        │             │                    │
//!   Bucket(n)     Bucket(n)            Bucket(n+1)
//!   ┌────────┐    ┌────────┐           ┌────────┐
//!   │  Leaf  │    │  Leaf  │           │  Leaf  │   id → Weak<Record>
//!   └────────┘    └────────┘           └────────┘
//! ```
//!
//! ## Concurrency
//!
//! Children are created on first touch under the branch's write lock, so concurrent
//! callers classifying into the same new key observe one child. Pruning runs bottom-up
//! from the evictor: a branch retires an empty child under its own write lock, and the
//! child refuses later puts with [`IndexingError::Retired`]. [`IndexTree::put`] retries
//! from the root in that case, so an entry is never inserted into a detached node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::trace;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::buffer::index_leaf::IndexLeaf;
use crate::common::config::RESERVED_RECORD_ID;
use crate::common::exception::IndexingError;
use crate::query::index_query::IndexQuery;
use crate::storage::index::branch_indexer::BranchIndexer;
use crate::storage::index::indexer::IndexKey;
use crate::types_db::record::{Record, RecordHeader};

/// What one clean pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub entries_removed: usize,
    pub leaves_pruned: usize,
    pub branches_pruned: usize,
}

pub enum IndexComponent {
    Branch(IndexBranch),
    Leaf(IndexLeaf),
}

impl IndexComponent {
    pub fn as_branch(&self) -> Option<&IndexBranch> {
        match self {
            IndexComponent::Branch(branch) => Some(branch),
            IndexComponent::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&IndexLeaf> {
        match self {
            IndexComponent::Leaf(leaf) => Some(leaf),
            IndexComponent::Branch(_) => None,
        }
    }

    fn put(&self, record: &Arc<Record>) -> Result<(), IndexingError> {
        match self {
            IndexComponent::Branch(branch) => branch.put(record),
            IndexComponent::Leaf(leaf) => leaf.put(record),
        }
    }

    fn clean(&self, stats: &mut CleanStats) -> bool {
        match self {
            IndexComponent::Branch(branch) => branch.clean(stats),
            IndexComponent::Leaf(leaf) => {
                let (removed, empty) = leaf.clean_counted();
                stats.entries_removed += removed;
                empty
            }
        }
    }

    fn try_retire(&self) -> bool {
        match self {
            IndexComponent::Branch(branch) => branch.try_retire(),
            IndexComponent::Leaf(leaf) => leaf.try_retire(),
        }
    }

    fn retire(&self) {
        match self {
            IndexComponent::Branch(branch) => branch.retire(),
            IndexComponent::Leaf(leaf) => leaf.retire(),
        }
    }

    fn collect(&self, query: &IndexQuery, out: &mut Vec<Arc<Record>>) {
        match self {
            IndexComponent::Branch(branch) => {
                for child in branch.children_for(query) {
                    child.collect(query, out);
                }
            }
            IndexComponent::Leaf(leaf) => leaf.collect(query, out),
        }
    }

    fn par_collect(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        match self {
            IndexComponent::Branch(branch) => branch
                .children_for(query)
                .par_iter()
                .map(|child| child.par_collect(query))
                .reduce(Vec::new, |mut left, mut right| {
                    left.append(&mut right);
                    left
                }),
            IndexComponent::Leaf(leaf) => {
                let mut out = Vec::new();
                leaf.collect(query, &mut out);
                out
            }
        }
    }

    fn leaf_count(&self) -> usize {
        match self {
            IndexComponent::Branch(branch) => branch
                .children
                .read()
                .values()
                .map(|child| child.leaf_count())
                .sum(),
            IndexComponent::Leaf(_) => 1,
        }
    }

    fn live_entries(&self) -> usize {
        match self {
            IndexComponent::Branch(branch) => branch
                .children
                .read()
                .values()
                .map(|child| child.live_entries())
                .sum(),
            IndexComponent::Leaf(leaf) => leaf.size(),
        }
    }
}

pub struct IndexBranch {
    indexer: Arc<BranchIndexer>,
    children: RwLock<HashMap<IndexKey, Arc<IndexComponent>>>,
    retired: AtomicBool,
}

impl IndexBranch {
    pub fn new(indexer: Arc<BranchIndexer>) -> Self {
        Self {
            indexer,
            children: RwLock::new(HashMap::new()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn indexer(&self) -> &Arc<BranchIndexer> {
        &self.indexer
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Returns the child a record classifies into, creating it on first touch.
    pub fn get_next_component(&self, header: &RecordHeader) -> Result<Arc<IndexComponent>, IndexingError> {
        let key = self.indexer.indexer().key(header);
        {
            let children = self.children.read();
            if self.retired.load(Ordering::Acquire) {
                return Err(IndexingError::Retired);
            }
            if let Some(child) = children.get(&key) {
                return Ok(Arc::clone(child));
            }
        }

        let mut children = self.children.write();
        if self.retired.load(Ordering::Acquire) {
            return Err(IndexingError::Retired);
        }
        let child = children
            .entry(key)
            .or_insert_with(|| Arc::new(self.create_child()));
        Ok(Arc::clone(child))
    }

    fn create_child(&self) -> IndexComponent {
        match self.indexer.next_indexer() {
            Some(indexer) => IndexComponent::Branch(IndexBranch::new(indexer)),
            None => IndexComponent::Leaf(IndexLeaf::new(self.indexer.leaf_id())),
        }
    }

    fn put(&self, record: &Arc<Record>) -> Result<(), IndexingError> {
        self.get_next_component(record.header())?.put(record)
    }

    fn children_for(&self, query: &IndexQuery) -> Vec<Arc<IndexComponent>> {
        let children = self.children.read();
        match self.indexer.indexer().keys(query) {
            Some(keys) => keys.iter().filter_map(|key| children.get(key).cloned()).collect(),
            None => children.values().cloned().collect(),
        }
    }

    /// Cleans every child, prunes the ones that end up empty and reports whether this
    /// branch has no children left.
    fn clean(&self, stats: &mut CleanStats) -> bool {
        let snapshot: Vec<(IndexKey, Arc<IndexComponent>)> = self
            .children
            .read()
            .iter()
            .map(|(key, child)| (key.clone(), Arc::clone(child)))
            .collect();

        let empty: Vec<IndexKey> = snapshot
            .into_iter()
            .filter(|(_, child)| child.clean(stats))
            .map(|(key, _)| key)
            .collect();

        let mut children = self.children.write();
        for key in empty {
            let Some(child) = children.get(&key) else {
                continue;
            };
            if child.try_retire() {
                match child.as_ref() {
                    IndexComponent::Branch(_) => stats.branches_pruned += 1,
                    IndexComponent::Leaf(_) => stats.leaves_pruned += 1,
                }
                children.remove(&key);
                trace!("Pruned empty index child {:?}", key);
            }
        }
        children.is_empty()
    }

    fn try_retire(&self) -> bool {
        let children = self.children.write();
        if children.is_empty() {
            self.retired.store(true, Ordering::Release);
        }
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        let mut children = self.children.write();
        self.retired.store(true, Ordering::Release);
        for child in children.values() {
            child.retire();
        }
        children.clear();
    }

    fn clear(&self) {
        let mut children = self.children.write();
        for child in children.values() {
            child.retire();
        }
        children.clear();
    }
}

/// Root of the live index.
pub struct IndexTree {
    root: IndexBranch,
}

impl IndexTree {
    pub fn new(indexer: BranchIndexer) -> Self {
        Self {
            root: IndexBranch::new(Arc::new(indexer)),
        }
    }

    pub fn root(&self) -> &IndexBranch {
        &self.root
    }

    /// Indexes a record without taking ownership of it.
    pub fn put(&self, record: &Arc<Record>) -> Result<(), IndexingError> {
        if record.id() == RESERVED_RECORD_ID {
            return Err(IndexingError::InvalidId);
        }
        loop {
            match self.root.put(record) {
                Err(IndexingError::Retired) => {
                    trace!("Index node retired under record {}, retrying", record.id());
                }
                other => return other,
            }
        }
    }

    /// Leaf a record with this header classifies into, if it exists.
    pub fn leaf_for(&self, header: &RecordHeader) -> Option<Arc<IndexComponent>> {
        let mut node = self.root.existing_child(header)?;
        while let IndexComponent::Branch(branch) = node.as_ref() {
            let next = branch.existing_child(header)?;
            node = next;
        }
        Some(node)
    }

    pub fn get(&self, header: &RecordHeader) -> Option<Arc<Record>> {
        self.leaf_for(header)?.as_leaf()?.get(header.id)
    }

    pub fn get_and_remove(&self, header: &RecordHeader) -> Option<Arc<Record>> {
        self.leaf_for(header)?.as_leaf()?.get_and_remove(header.id)
    }

    /// Sweeps dead handles from every leaf and prunes empty nodes bottom-up.
    pub fn clean(&self) -> CleanStats {
        let mut stats = CleanStats::default();
        self.root.clean(&mut stats);
        stats
    }

    /// Drops every node. Concurrent puts into dropped nodes are retried from the root.
    pub fn clear(&self) {
        self.root.clear();
    }

    pub fn query(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        let mut out = Vec::new();
        for child in self.root.children_for(query) {
            child.collect(query, &mut out);
        }
        out
    }

    pub fn query_parallel(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        self.root
            .children_for(query)
            .par_iter()
            .map(|child| child.par_collect(query))
            .reduce(Vec::new, |mut left, mut right| {
                left.append(&mut right);
                left
            })
    }

    pub fn leaf_count(&self) -> usize {
        self.root.children.read().values().map(|child| child.leaf_count()).sum()
    }

    pub fn live_entries(&self) -> usize {
        self.root.children.read().values().map(|child| child.live_entries()).sum()
    }
}

impl IndexBranch {
    fn existing_child(&self, header: &RecordHeader) -> Option<Arc<IndexComponent>> {
        let key = self.indexer.indexer().key(header);
        self.children.read().get(&key).cloned()
    }
}
