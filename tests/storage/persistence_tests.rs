use std::fs::File;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use perfstore::common::config::INDEX_FRAME_MAGIC;
use perfstore::common::exception::{HandleError, StorageError};
use perfstore::query::index_query::IndexQuery;
use perfstore::storage::disk::async_disk::{FileOps, PositionalFileOps};
use perfstore::storage::index::storage_leaf::StorageDescriptor;
use perfstore::storage::persistence::{JobStatus, PersistenceManager, WritingStatus};
use perfstore::types_db::record::{Record, RecordHeader, RecordKind};
use tokio::runtime::Handle;

use crate::common::logger::init_test_logger;
use crate::common::tempdir::{record, temp_config};

const POISON: &[u8] = b"#POISON#";

/// Fails every write whose bytes contain [`POISON`].
#[derive(Debug)]
struct PoisonedWrites;

impl FileOps for PoisonedWrites {
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        if buf.windows(POISON.len()).any(|window| window == POISON) {
            return Err(io::Error::other("injected device error"));
        }
        PositionalFileOps.write_at(file, buf, offset)
    }

    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        PositionalFileOps.read_at(file, buf, offset)
    }
}

/// Fails the index frame written at the start of the index container, once.
#[derive(Debug, Default)]
struct FirstIndexFrameFails {
    tripped: AtomicBool,
}

impl FileOps for FirstIndexFrameFails {
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        let frame = buf.starts_with(&INDEX_FRAME_MAGIC.to_le_bytes());
        if frame && offset == 0 && !self.tripped.swap(true, Ordering::AcqRel) {
            return Err(io::Error::other("injected device error"));
        }
        PositionalFileOps.write_at(file, buf, offset)
    }

    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        PositionalFileOps.read_at(file, buf, offset)
    }
}

fn poisoned(id: u64) -> Arc<Record> {
    let mut payload = vec![0u8; 16];
    payload.extend_from_slice(POISON);
    Arc::new(Record::new(RecordHeader::new(id, RecordKind::Timer).platform(1), payload))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_write_does_not_hang_close_or_leave_an_entry() {
    init_test_logger();
    let (_dir, config) = temp_config();
    let manager = PersistenceManager::with_file_ops(&config, Arc::new(PoisonedWrites), Handle::current());
    let job = assert_ok!(manager.begin_job(9).await);

    for id in 1..=20 {
        let r = if id == 7 { poisoned(id) } else { record(id, RecordKind::Timer, 1, 32) };
        assert_ok!(manager.persist(&job, r));
    }
    let index = job.index();
    let report = assert_ok!(manager.close_job(job.clone()).await);

    assert_eq!(report.records_written, 19);
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(job.writing_status(), WritingStatus::Failed);

    assert_eq!(index.len(), 19);
    assert!(index.find(7).is_none());
    let reloaded = assert_ok!(manager.load_index(9).await);
    assert_eq!(reloaded.len(), 19);
    assert!(reloaded.find(7).is_none());

    for descriptor in reloaded.query(&IndexQuery::new()) {
        let back = assert_ok!(manager.read_record(9, &descriptor).await);
        assert_eq!(back.id(), descriptor.id);
        assert_eq!(back.payload().len(), 32);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_lifecycle_errors() {
    init_test_logger();
    let (_dir, config) = temp_config();
    let manager = PersistenceManager::new(&config, Handle::current());

    let job = assert_ok!(manager.begin_job(1).await);
    assert!(matches!(manager.begin_job(1).await, Err(StorageError::JobExists(1))));
    assert_eq!(job.writing_status(), WritingStatus::Idle);

    let report = assert_ok!(manager.close_job(job.clone()).await);
    assert_eq!(report.status, JobStatus::Complete);
    assert_eq!(report.records_written, 0);

    assert!(matches!(manager.persist(&job, record(1, RecordKind::Timer, 1, 8)), Err(StorageError::JobClosed(1))));
    assert!(matches!(manager.close_job(job).await, Err(StorageError::JobClosed(1))));
    assert_err!(manager.load_index(404).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_exhaustion_is_reported_to_the_caller() {
    init_test_logger();
    let (_dir, mut config) = temp_config();
    config.buffer_size = 16;
    config.pool_min_capacity = 0;
    config.pool_max_capacity = 2;
    let manager = PersistenceManager::new(&config, Handle::current());
    let job = assert_ok!(manager.begin_job(2).await);

    let result = manager.persist(&job, record(1, RecordKind::Timer, 1, 4096));
    assert!(matches!(result, Err(StorageError::Pool(_))));

    let report = assert_ok!(manager.close_job(job).await);
    assert_eq!(report.records_written, 0);
    assert_eq!(report.records_failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_index_frame_leaves_container_loadable() {
    init_test_logger();
    let (_dir, config) = temp_config();
    let manager = PersistenceManager::with_file_ops(&config, Arc::new(FirstIndexFrameFails::default()), Handle::current());
    let job = assert_ok!(manager.begin_job(4).await);

    for id in 1..=5 {
        assert_ok!(manager.persist(&job, record(id, RecordKind::Timer, 1, 40)));
    }
    let index = job.index();
    let report = assert_ok!(manager.close_job(job).await);
    assert_eq!(report.records_written, 4);
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.status, JobStatus::Partial);

    let mut expected: Vec<_> = index.query(&IndexQuery::new()).iter().map(|d| d.id).collect();
    expected.sort_unstable();
    assert_eq!(expected.len(), 4);

    let reloaded = assert_ok!(manager.load_index(4).await);
    let mut ids: Vec<_> = reloaded.query(&IndexQuery::new()).iter().map(|d| d.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, expected);
    for descriptor in reloaded.query(&IndexQuery::new()) {
        assert_eq!(assert_ok!(manager.read_record(4, &descriptor).await).id(), descriptor.id);
    }

    let resumed = assert_ok!(manager.begin_job(4).await);
    assert_eq!(resumed.index().len(), 4);
    assert_ok!(manager.persist(&resumed, record(6, RecordKind::Timer, 1, 40)));
    assert_ok!(manager.close_job(resumed).await);
    let reloaded = assert_ok!(manager.load_index(4).await);
    assert_eq!(reloaded.len(), 5);
    assert!(reloaded.find(6).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn container_cannot_be_resumed_while_closing() {
    init_test_logger();
    let (_dir, config) = temp_config();
    let manager = Arc::new(PersistenceManager::new(&config, Handle::current()));
    let job = assert_ok!(manager.begin_job(8).await);
    for id in 1..=400 {
        assert_ok!(manager.persist(&job, record(id, RecordKind::Timer, id % 4, 64)));
    }

    let closing = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.close_job(job).await })
    };
    let resumed = loop {
        match manager.begin_job(8).await {
            Ok(resumed) => break resumed,
            Err(StorageError::JobExists(8)) => tokio::task::yield_now().await,
            Err(e) => panic!("unexpected error while closing: {e}"),
        }
    };

    let report = assert_ok!(closing.await.unwrap());
    assert_eq!(report.records_written, 400);
    assert_eq!(resumed.index().len(), 400);
    assert_ok!(manager.close_job(resumed).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reading_a_missing_container_creates_nothing() {
    init_test_logger();
    let (_dir, config) = temp_config();
    let manager = PersistenceManager::new(&config, Handle::current());
    let descriptor = StorageDescriptor { id: 1, leaf_id: 1, offset: 0, length: 32 };

    let result = manager.read_record(999, &descriptor).await;
    assert!(matches!(result, Err(StorageError::Handle(HandleError::Io(ref e))) if e.kind() == io::ErrorKind::NotFound));
    assert!(!manager.data_path(999).exists());
    assert_eq!(manager.handles().registered_count(), 0);
}
