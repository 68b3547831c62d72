use std::sync::Arc;

use perfstore::common::config::DataPlaneConfig;
use perfstore::types_db::record::{Record, RecordHeader, RecordKind};
use tempfile::TempDir;

/// Small-buffer configuration rooted in a fresh temp dir. Keep the dir alive for the test.
pub fn temp_config() -> (TempDir, DataPlaneConfig) {
    let dir = TempDir::new().unwrap();
    let config = DataPlaneConfig {
        storage_root: dir.path().join("containers"),
        buffer_size: 256,
        pool_min_capacity: 4,
        pool_max_capacity: 512,
        max_open_handles: 8,
        eviction_interval_ms: 20,
        ..DataPlaneConfig::default()
    };
    (dir, config)
}

pub fn record(id: u64, kind: RecordKind, platform: u64, payload_len: usize) -> Arc<Record> {
    let header = RecordHeader::new(id, kind).platform(platform).sensor_type(platform % 3);
    Arc::new(Record::new(header, vec![(id % 251) as u8; payload_len]))
}
