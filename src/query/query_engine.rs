use std::collections::HashSet;
use std::sync::Arc;

use log::trace;

use crate::buffer::index_tree::IndexTree;
use crate::query::index_query::IndexQuery;
use crate::types_db::record::{Record, RecordHeader};

/// Answers queries against the live index. Results are strong references, so a record
/// stays alive for as long as the caller holds the result even if it is evicted meanwhile.
#[derive(Clone)]
pub struct QueryEngine {
    tree: Arc<IndexTree>,
}

impl QueryEngine {
    pub fn new(tree: Arc<IndexTree>) -> Self {
        Self { tree }
    }

    pub fn index_tree(&self) -> &Arc<IndexTree> {
        &self.tree
    }

    /// Walks the tree on the calling thread.
    pub fn query(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        let results = dedup(self.tree.query(query));
        trace!("Sequential query matched {} records", results.len());
        results
    }

    /// Fans the walk out over the rayon pool, one task per matching subtree.
    pub fn query_parallel(&self, query: &IndexQuery) -> Vec<Arc<Record>> {
        let results = dedup(self.tree.query_parallel(query));
        trace!("Parallel query matched {} records", results.len());
        results
    }

    /// Newest `limit` matches, by record timestamp.
    pub fn query_latest(&self, query: &IndexQuery, limit: usize) -> Vec<Arc<Record>> {
        let mut results = self.query_parallel(query);
        results.sort_unstable_by(|a, b| {
            b.header()
                .timestamp_ms
                .cmp(&a.header().timestamp_ms)
                .then_with(|| b.id().cmp(&a.id()))
        });
        results.truncate(limit);
        results
    }

    pub fn get(&self, header: &RecordHeader) -> Option<Arc<Record>> {
        self.tree.get(header)
    }

    pub fn count(&self, query: &IndexQuery) -> usize {
        self.query(query).len()
    }
}

// A record re-put after its leaf was pruned can be seen twice during a concurrent clean.
fn dedup(records: Vec<Arc<Record>>) -> Vec<Arc<Record>> {
    let mut seen = HashSet::with_capacity(records.len());
    records.into_iter().filter(|record| seen.insert(record.id())).collect()
}
