use std::fmt;

use bincode::{Decode, Encode};

use crate::common::config::{DEFAULT_TIME_BUCKET_MS, Ident};
use crate::query::index_query::IndexQuery;
use crate::types_db::record::{RecordHeader, RecordKind};

/// Discrete classification key produced by an [`Indexer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub enum IndexKey {
    Ident(Ident),
    Kind(RecordKind),
    TimeBucket(i64),
}

/// Classification function of one tree level.
pub trait Indexer: Send + Sync + fmt::Debug {
    /// Key of the child a record belongs to.
    fn key(&self, header: &RecordHeader) -> IndexKey;

    /// Keys of the children a query can match, or `None` when this level cannot narrow
    /// the query and every child has to be visited.
    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformIdentIndexer;

impl Indexer for PlatformIdentIndexer {
    fn key(&self, header: &RecordHeader) -> IndexKey {
        IndexKey::Ident(header.platform_ident)
    }

    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>> {
        query.platform_ident.map(|ident| vec![IndexKey::Ident(ident)])
    }

    fn name(&self) -> &'static str {
        "platform"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SensorTypeIdentIndexer;

impl Indexer for SensorTypeIdentIndexer {
    fn key(&self, header: &RecordHeader) -> IndexKey {
        IndexKey::Ident(header.sensor_type_ident)
    }

    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>> {
        query.sensor_type_ident.map(|ident| vec![IndexKey::Ident(ident)])
    }

    fn name(&self) -> &'static str {
        "sensor_type"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MethodIdentIndexer;

impl Indexer for MethodIdentIndexer {
    fn key(&self, header: &RecordHeader) -> IndexKey {
        IndexKey::Ident(header.method_ident)
    }

    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>> {
        query.method_ident.map(|ident| vec![IndexKey::Ident(ident)])
    }

    fn name(&self) -> &'static str {
        "method"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecordKindIndexer;

impl Indexer for RecordKindIndexer {
    fn key(&self, header: &RecordHeader) -> IndexKey {
        IndexKey::Kind(header.kind)
    }

    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>> {
        if query.kinds.is_empty() {
            return None;
        }
        let mut keys = Vec::with_capacity(query.kinds.len());
        for key in query.kinds.iter().copied().map(IndexKey::Kind) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Some(keys)
    }

    fn name(&self) -> &'static str {
        "kind"
    }
}

/// Buckets records by timestamp. Narrows a query only when it has a closed window spanning
/// at most [`TimestampIndexer::MAX_QUERY_BUCKETS`] buckets.
#[derive(Debug, Clone, Copy)]
pub struct TimestampIndexer {
    bucket_ms: i64,
}

impl TimestampIndexer {
    pub const MAX_QUERY_BUCKETS: i64 = 4096;

    pub fn new(bucket_ms: i64) -> Self {
        Self {
            bucket_ms: bucket_ms.max(1),
        }
    }

    fn bucket(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.bucket_ms)
    }
}

impl Default for TimestampIndexer {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_BUCKET_MS)
    }
}

impl Indexer for TimestampIndexer {
    fn key(&self, header: &RecordHeader) -> IndexKey {
        IndexKey::TimeBucket(self.bucket(header.timestamp_ms))
    }

    fn keys(&self, query: &IndexQuery) -> Option<Vec<IndexKey>> {
        let (from, to) = (query.from_ms?, query.to_ms?);
        if from > to {
            return Some(Vec::new());
        }
        let (first, last) = (self.bucket(from), self.bucket(to));
        if last.checked_sub(first).is_none_or(|span| span >= Self::MAX_QUERY_BUCKETS) {
            return None;
        }
        Some((first..=last).map(IndexKey::TimeBucket).collect())
    }

    fn name(&self) -> &'static str {
        "timestamp"
    }
}
