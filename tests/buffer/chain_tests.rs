use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use perfstore::buffer::atomic_buffer::AtomicBuffer;
use perfstore::buffer::buffer_element::ElementState;
use perfstore::buffer::index_leaf::IndexLeaf;
use perfstore::buffer::index_tree::IndexTree;
use perfstore::common::config::DataPlaneConfig;
use perfstore::query::index_query::IndexQuery;
use perfstore::storage::index::branch_indexer::BranchIndexer;
use perfstore::types_db::record::RecordKind;

use crate::common::logger::init_test_logger;
use crate::common::tempdir::record;

fn chain(config: &DataPlaneConfig) -> AtomicBuffer {
    AtomicBuffer::new(config, Arc::new(IndexTree::new(BranchIndexer::buffer_default())))
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    init_test_logger();
    let buffer = Arc::new(chain(&DataPlaneConfig::default()));
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_000;

    let workers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let id = producer * PER_PRODUCER + seq + 1;
                    buffer.append(record(id, RecordKind::Timer, producer, 8));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let ids: Vec<_> = buffer.iter().map(|element| element.id()).collect();
    assert_eq!(ids.len() as u64, PRODUCERS * PER_PRODUCER);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());

    for producer in 0..PRODUCERS {
        let own: Vec<_> = ids
            .iter()
            .copied()
            .filter(|id| (id - 1) / PER_PRODUCER == producer)
            .collect();
        assert!(own.windows(2).all(|w| w[0] < w[1]), "producer {producer} reordered");
    }
}

#[test]
fn analyzer_indexes_without_owning() {
    init_test_logger();
    let buffer = chain(&DataPlaneConfig::default());
    let held = record(1, RecordKind::SqlStatement, 5, 64);
    buffer.append(Arc::clone(&held));
    for id in 2..=10 {
        buffer.append(record(id, RecordKind::SqlStatement, 5, 64));
    }
    assert_eq!(buffer.analyze_pending(), 10);
    assert!(buffer.iter().all(|element| element.state() == ElementState::Indexed));
    assert!(buffer.current_size() > 0);

    let tree = Arc::clone(buffer.index_tree());
    assert_eq!(tree.live_entries(), 10);

    buffer.clear_all();
    assert_eq!(tree.query(&IndexQuery::new()).len(), 0);
    assert_eq!(buffer.current_size(), 0);
    assert_eq!(Arc::strong_count(&held), 1);
}

#[test]
fn leaf_empties_once_referents_are_gone() {
    init_test_logger();
    let leaf = IndexLeaf::new(1);
    let records: Vec<_> = (1..=100).map(|id| record(id, RecordKind::Timer, 1, 4)).collect();
    for r in &records {
        assert_ok!(leaf.put(r));
    }
    let survivor = Arc::clone(&records[42]);

    drop(records);
    assert!(!leaf.clean(), "a live referent keeps the leaf non-empty");
    assert_eq!(leaf.size(), 1);

    drop(survivor);
    assert!(leaf.clean());
    assert_eq!(leaf.size(), 0);
}

#[test]
fn reserved_id_is_never_indexed() {
    init_test_logger();
    let tree = IndexTree::new(BranchIndexer::buffer_default());
    let zero = record(0, RecordKind::Timer, 1, 4);
    assert_err!(tree.put(&zero));
    assert_eq!(tree.leaf_count(), 0);
}
