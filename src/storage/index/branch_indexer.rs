//! Per-level configuration of index branches.
//!
//! A [`BranchIndexer`] couples a classification function with the configuration of the
//! level below it. The child configuration is either shared by every branch of the level
//! or instantiated afresh for each branch:
//!
//! ```text
//!            root: kind indexer (id 1)
//!          ┌───────────┴────────────┐
//!   Timer branch              Exception branch
//!   ┌──────────────────┐     ┌──────────────────┐
//!   │ Shared: id 2     │ ═══ │ Shared: id 2     │   same Arc, same state
//!   └──────────────────┘     └──────────────────┘
//!   ┌──────────────────┐     ┌──────────────────┐
//!   │ Owned:  id 7     │     │ Owned:  id 8     │   fresh instance per branch
//!   └──────────────────┘     └──────────────────┘
//!   ┌──────────────────┐     ┌──────────────────┐
//!   │ Owned + pass_id: │     │ Owned + pass_id: │   fresh instance, parent's id
//!   │ id 1             │     │ id 1             │
//!   └──────────────────┘     └──────────────────┘
//! ```
//!
//! Ids label the leaves a level creates; storage descriptors carry them so entries written
//! under one branch can be grouped again after reload.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::config::LeafId;
use crate::storage::index::indexer::{
    Indexer, PlatformIdentIndexer, RecordKindIndexer, SensorTypeIdentIndexer, TimestampIndexer,
};

static NEXT_INDEXER_ID: AtomicU32 = AtomicU32::new(1);

fn fresh_id() -> LeafId {
    NEXT_INDEXER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Configuration of the level below a branch.
#[derive(Debug, Clone)]
pub enum ChildIndexer {
    /// One instance reused by every sibling branch.
    Shared(Arc<BranchIndexer>),
    /// Template instantiated once per branch.
    Owned(Box<BranchIndexer>),
}

#[derive(Debug, Clone)]
pub struct BranchIndexer {
    id: LeafId,
    indexer: Arc<dyn Indexer>,
    child: Option<ChildIndexer>,
    pass_id: bool,
}

impl BranchIndexer {
    /// Indexer of the last branch level; its children are leaves.
    pub fn new(indexer: impl Indexer + 'static) -> Self {
        Self {
            id: fresh_id(),
            indexer: Arc::new(indexer),
            child: None,
            pass_id: false,
        }
    }

    pub fn with_shared_child(mut self, child: Arc<BranchIndexer>) -> Self {
        self.child = Some(ChildIndexer::Shared(child));
        self
    }

    pub fn with_owned_child(mut self, child: BranchIndexer) -> Self {
        self.child = Some(ChildIndexer::Owned(Box::new(child)));
        self
    }

    /// When set, indexers instantiated below this one and leaves created by it inherit
    /// this indexer's id instead of drawing a new one.
    pub fn passing_id(mut self, pass_id: bool) -> Self {
        self.pass_id = pass_id;
        self
    }

    pub fn id(&self) -> LeafId {
        self.id
    }

    pub fn indexer(&self) -> &dyn Indexer {
        self.indexer.as_ref()
    }

    pub fn passes_id(&self) -> bool {
        self.pass_id
    }

    pub fn child(&self) -> Option<&ChildIndexer> {
        self.child.as_ref()
    }

    /// Resolves the indexer for a newly created child branch, or `None` when the
    /// children of this level are leaves.
    pub fn next_indexer(&self) -> Option<Arc<BranchIndexer>> {
        match self.child.as_ref()? {
            ChildIndexer::Shared(shared) => Some(Arc::clone(shared)),
            ChildIndexer::Owned(template) => {
                let inherited = self.pass_id.then_some(self.id);
                Some(Arc::new(template.instantiate(inherited)))
            }
        }
    }

    /// Id for a leaf created directly below this level.
    pub fn leaf_id(&self) -> LeafId {
        if self.pass_id { self.id } else { fresh_id() }
    }

    fn instantiate(&self, inherited: Option<LeafId>) -> BranchIndexer {
        BranchIndexer {
            id: inherited.unwrap_or_else(fresh_id),
            indexer: Arc::clone(&self.indexer),
            child: self.child.clone(),
            pass_id: self.pass_id,
        }
    }

    /// Live cache layout: platform, then record kind (shared), then time bucket.
    pub fn buffer_default() -> Self {
        let buckets = Arc::new(BranchIndexer::new(TimestampIndexer::default()));
        let kinds = BranchIndexer::new(RecordKindIndexer).with_shared_child(buckets);
        BranchIndexer::new(PlatformIdentIndexer).with_owned_child(kinds)
    }

    /// Storage layout: record kind, then platform, then sensor type. Leaves under one kind
    /// share the kind branch's id.
    pub fn storage_default() -> Self {
        let sensors = BranchIndexer::new(SensorTypeIdentIndexer).passing_id(true);
        let platforms = BranchIndexer::new(PlatformIdentIndexer)
            .with_owned_child(sensors)
            .passing_id(true);
        BranchIndexer::new(RecordKindIndexer).with_owned_child(platforms)
    }
}
