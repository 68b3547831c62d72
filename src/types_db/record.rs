use std::fmt;
use std::hash::{Hash, Hasher};

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};

use crate::common::config::{Ident, MAX_NESTING_DEPTH, RecordId, storage_bincode_config};
use crate::common::exception::RecordError;
use crate::common::object_sizes::ObjectSizes;

/// Category of a measurement. Drives index classification and selects the order-preserving
/// storage leaf for hierarchical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum RecordKind {
    Timer,
    HttpTimer,
    SqlStatement,
    Exception,
    InvocationSequence,
    SystemInformation,
    ClassLoading,
}

impl RecordKind {
    /// Records whose nested children form a call tree that must be restored in order.
    pub fn is_hierarchical(self) -> bool {
        matches!(self, RecordKind::InvocationSequence)
    }
}

/// Classification fields of a record. Everything an indexer may look at lives here.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RecordHeader {
    pub id: RecordId,
    pub platform_ident: Ident,
    pub sensor_type_ident: Ident,
    pub method_ident: Ident,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub kind: RecordKind,
}

impl RecordHeader {
    pub fn new(id: RecordId, kind: RecordKind) -> Self {
        Self {
            id,
            platform_ident: 0,
            sensor_type_ident: 0,
            method_ident: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn platform(mut self, platform_ident: Ident) -> Self {
        self.platform_ident = platform_ident;
        self
    }

    pub fn sensor_type(mut self, sensor_type_ident: Ident) -> Self {
        self.sensor_type_ident = sensor_type_ident;
        self
    }

    pub fn method(mut self, method_ident: Ident) -> Self {
        self.method_ident = method_ident;
        self
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

/// One ingested measurement. Immutable once it enters the chain; identity is the id.
#[derive(Clone, Encode, Decode)]
pub struct Record {
    header: RecordHeader,
    payload: Vec<u8>,
    nested: Vec<Record>,
}

impl Record {
    pub fn new(header: RecordHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            nested: Vec::new(),
        }
    }

    pub fn with_nested(mut self, nested: Vec<Record>) -> Self {
        self.nested = nested;
        self
    }

    pub fn id(&self) -> RecordId {
        self.header.id
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn kind(&self) -> RecordKind {
        self.header.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn nested(&self) -> &[Record] {
        &self.nested
    }

    /// Computes the in-memory footprint of this record and all nested children.
    ///
    /// Walks the nesting iteratively so a deep call tree cannot overflow the stack, and
    /// reports trees deeper than [`MAX_NESTING_DEPTH`] or overflowing sizes as malformed.
    pub fn calculate_size(&self, sizes: &ObjectSizes) -> Result<u64, RecordError> {
        let mut total: u64 = 0;
        let mut pending: Vec<(&Record, usize)> = vec![(self, 0)];

        while let Some((record, depth)) = pending.pop() {
            if depth > MAX_NESTING_DEPTH {
                return Err(RecordError::Malformed(format!(
                    "record {} nests deeper than {} levels",
                    self.id(),
                    MAX_NESTING_DEPTH
                )));
            }
            let own = sizes
                .record_footprint(record.payload.len(), record.nested.len())
                .ok_or_else(|| overflow(self.id()))?;
            total = total.checked_add(own).ok_or_else(|| overflow(self.id()))?;
            pending.extend(record.nested.iter().map(|child| (child, depth + 1)));
        }

        Ok(sizes.with_expansion(total))
    }

    pub fn encode_to_vec(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, storage_bincode_config())
    }

    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (record, _) = bincode::decode_from_slice(bytes, storage_bincode_config())?;
        Ok(record)
    }
}

fn overflow(id: RecordId) -> RecordError {
    RecordError::Malformed(format!("footprint of record {id} overflows"))
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.header.id == other.header.id
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.header.id.hash(state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("nested", &self.nested.len())
            .finish()
    }
}
