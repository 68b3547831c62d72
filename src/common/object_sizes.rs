//! Footprint model used when the analyzer computes how much memory a record occupies.
//!
//! The model charges every record an object header, its fixed header fields, one
//! vector header per owned collection, the payload bytes and one reference per nested
//! child, each aligned to the allocation granularity. The sum is then widened by the
//! configured expansion rate so the chain budget errs on the side of evicting early.

use std::mem::size_of;

use crate::types_db::record::RecordHeader;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSizes {
    object_header: u64,
    reference: u64,
    vec_header: u64,
    alignment: u64,
    expansion_rate: f32,
}

impl Default for ObjectSizes {
    fn default() -> Self {
        Self {
            object_header: 16,
            reference: size_of::<usize>() as u64,
            vec_header: 3 * size_of::<usize>() as u64,
            alignment: 8,
            expansion_rate: 0.0,
        }
    }
}

impl ObjectSizes {
    pub fn new(expansion_rate: f32) -> Self {
        Self {
            expansion_rate: expansion_rate.max(0.0),
            ..Self::default()
        }
    }

    pub fn expansion_rate(&self) -> f32 {
        self.expansion_rate
    }

    /// Rounds `size` up to the allocation granularity.
    pub fn align(&self, size: u64) -> Option<u64> {
        let rounded = size.checked_add(self.alignment - 1)?;
        Some(rounded / self.alignment * self.alignment)
    }

    /// Footprint of a single record, excluding its nested children's own footprints.
    pub fn record_footprint(&self, payload_len: usize, nested_count: usize) -> Option<u64> {
        let header = self.align(self.object_header + size_of::<RecordHeader>() as u64)?;
        let payload = self.align(self.vec_header.checked_add(payload_len as u64)?)?;
        let children = (nested_count as u64)
            .checked_mul(self.reference)?
            .checked_add(self.vec_header)?;
        header.checked_add(payload)?.checked_add(self.align(children)?)
    }

    /// Applies the expansion rate on top of a computed footprint.
    pub fn with_expansion(&self, size: u64) -> u64 {
        let margin = (size as f64 * f64::from(self.expansion_rate)) as u64;
        size.saturating_add(margin)
    }
}
