use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::common::config::{Ident, RecordId};
use crate::types_db::record::{Record, RecordHeader, RecordKind};

type RecordPredicate = dyn Fn(&Record) -> bool + Send + Sync;

/// Restrictions evaluated against indexed records.
///
/// Header restrictions let branches skip whole subtrees; the optional predicate is only
/// evaluated on records that survived every restriction. An empty query matches everything.
#[derive(Clone, Default)]
pub struct IndexQuery {
    pub platform_ident: Option<Ident>,
    pub sensor_type_ident: Option<Ident>,
    pub method_ident: Option<Ident>,
    pub kinds: Vec<RecordKind>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub min_id: Option<RecordId>,
    pub include_ids: Option<HashSet<RecordId>>,
    pub exclude_ids: HashSet<RecordId>,
    predicate: Option<Arc<RecordPredicate>>,
}

impl IndexQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query with only a record predicate.
    pub fn matching<F>(predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self::default().filter(predicate)
    }

    pub fn platform(mut self, ident: Ident) -> Self {
        self.platform_ident = Some(ident);
        self
    }

    pub fn sensor_type(mut self, ident: Ident) -> Self {
        self.sensor_type_ident = Some(ident);
        self
    }

    pub fn method(mut self, ident: Ident) -> Self {
        self.method_ident = Some(ident);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = RecordKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Inclusive timestamp window in milliseconds.
    pub fn between(mut self, from_ms: i64, to_ms: i64) -> Self {
        self.from_ms = Some(from_ms);
        self.to_ms = Some(to_ms);
        self
    }

    pub fn min_id(mut self, id: RecordId) -> Self {
        self.min_id = Some(id);
        self
    }

    pub fn include_ids(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.include_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn exclude_ids(mut self, ids: impl IntoIterator<Item = RecordId>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Id restrictions only. Persistent leaves hold no headers, so this is all they can apply.
    pub fn matches_id(&self, id: RecordId) -> bool {
        if self.min_id.is_some_and(|min| id < min) {
            return false;
        }
        if self.include_ids.as_ref().is_some_and(|ids| !ids.contains(&id)) {
            return false;
        }
        !self.exclude_ids.contains(&id)
    }

    pub fn matches_header(&self, header: &RecordHeader) -> bool {
        if self.platform_ident.is_some_and(|p| p != header.platform_ident)
            || self.sensor_type_ident.is_some_and(|s| s != header.sensor_type_ident)
            || self.method_ident.is_some_and(|m| m != header.method_ident)
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&header.kind) {
            return false;
        }
        if self.from_ms.is_some_and(|from| header.timestamp_ms < from)
            || self.to_ms.is_some_and(|to| header.timestamp_ms > to)
        {
            return false;
        }
        self.matches_id(header.id)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.matches_header(record.header())
            && self.predicate.as_ref().is_none_or(|predicate| predicate(record))
    }
}

impl fmt::Debug for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexQuery")
            .field("platform_ident", &self.platform_ident)
            .field("sensor_type_ident", &self.sensor_type_ident)
            .field("method_ident", &self.method_ident)
            .field("kinds", &self.kinds)
            .field("from_ms", &self.from_ms)
            .field("to_ms", &self.to_ms)
            .field("min_id", &self.min_id)
            .field("include_ids", &self.include_ids)
            .field("exclude_ids", &self.exclude_ids)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
