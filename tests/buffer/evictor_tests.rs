use std::sync::Arc;
use std::time::{Duration, Instant};

use perfstore::buffer::analyzer::Analyzer;
use perfstore::buffer::atomic_buffer::AtomicBuffer;
use perfstore::buffer::evictor::Evictor;
use perfstore::buffer::index_tree::IndexTree;
use perfstore::common::config::DataPlaneConfig;
use perfstore::query::index_query::IndexQuery;
use perfstore::storage::index::branch_indexer::BranchIndexer;
use perfstore::types_db::record::RecordKind;

use crate::common::logger::init_test_logger;
use crate::common::tempdir::record;

fn small_budget() -> DataPlaneConfig {
    DataPlaneConfig {
        buffer_max_size: 64 * 1024,
        eviction_occupancy_percentage: 0.5,
        eviction_fragment_size_percentage: 0.2,
        object_expansion_rate: 0.0,
        eviction_interval_ms: 10,
        ..DataPlaneConfig::default()
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_stages_keep_chain_within_budget() {
    init_test_logger();
    let config = small_budget();
    let tree = Arc::new(IndexTree::new(BranchIndexer::buffer_default()));
    let buffer = Arc::new(AtomicBuffer::new(&config, Arc::clone(&tree)));
    let mut analyzer = assert_ok!(Analyzer::spawn(Arc::clone(&buffer)));
    let evictor = Arc::new(Evictor::new(Arc::clone(&buffer), config.eviction_interval()));
    evictor.start();

    for id in 1..=2_000 {
        buffer.append(record(id, RecordKind::Timer, id % 7, 512));
    }
    eventually("analysis", || buffer.stats().elements_analyzed == 2_000).await;
    eventually("eviction", || !buffer.should_evict()).await;

    let stats = buffer.stats();
    assert!(stats.elements_evicted > 0);
    assert!(stats.current_size as f64 <= stats.max_size as f64 * 0.5);

    // Evicted records had no other holder, so the next sweep drops their entries.
    eventually("index sweep", || tree.live_entries() as u64 == 2_000 - stats.elements_evicted).await;
    let visible = tree.query(&IndexQuery::new()).len() as u64;
    assert!(visible <= 2_000 - stats.elements_evicted);

    evictor.stop();
    analyzer.stop();
    assert!(!evictor.is_running());
    assert!(!analyzer.is_running());
}

#[test]
fn held_records_survive_eviction() {
    init_test_logger();
    let config = small_budget();
    let tree = Arc::new(IndexTree::new(BranchIndexer::buffer_default()));
    let buffer = Arc::new(AtomicBuffer::new(&config, Arc::clone(&tree)));
    let evictor = Evictor::new(Arc::clone(&buffer), config.eviction_interval());

    let pinned = record(1, RecordKind::Exception, 1, 512);
    buffer.append(Arc::clone(&pinned));
    for id in 2..=500 {
        buffer.append(record(id, RecordKind::Exception, 1, 512));
    }
    buffer.analyze_pending();

    let cycle = evictor.run_once();
    assert!(cycle.chain.elements > 0);
    assert!(cycle.index.entries_removed > 0);
    assert_eq!(tree.get(pinned.header()).map(|r| r.id()), Some(1));
    assert_eq!(buffer.newest().map(|e| e.id()), Some(500));
}
