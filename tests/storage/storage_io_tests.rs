use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use perfstore::common::exception::{HandleError, StorageError};
use perfstore::storage::disk::async_disk::{
    BufferPool, FileOps, HandlePool, IoCoordinator, IoOutcome, PositionalFileOps, StorageReader, StorageWriter,
};
use rand::{Rng, RngCore};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::common::logger::init_test_logger;

const MAX_LEN: usize = 10 * 1024 * 1024;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Transfers at most `chunk` bytes per call, forcing the request loop to resubmit.
#[derive(Debug)]
struct ShortTransferOps {
    chunk: usize,
    calls: AtomicUsize,
}

impl FileOps for ShortTransferOps {
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let len = buf.len().min(self.chunk);
        PositionalFileOps.write_at(file, &buf[..len], offset)
    }

    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let len = buf.len().min(self.chunk);
        PositionalFileOps.read_at(file, &mut buf[..len], offset)
    }
}

async fn single_buffer_round_trip(path: &Path, bytes: &[u8]) -> Vec<u8> {
    let pool = BufferPool::new(bytes.len(), 0, 2);
    let handles = Arc::new(HandlePool::new(4));
    let writer = StorageWriter::new(Arc::clone(&handles), Handle::current());
    let reader = StorageReader::new(handles, Handle::current());

    let mut buffer = assert_ok!(pool.acquire());
    assert_eq!(buffer.fill_from(bytes), bytes.len());
    let (tx, rx) = oneshot::channel::<IoOutcome>();
    let coordinator = IoCoordinator::new(1, move |outcome| {
        let _ = tx.send(outcome);
    });
    let position = assert_ok!(writer.write(buffer, path, coordinator));
    let written = rx.await.unwrap();
    assert!(written.is_success(), "write failed: {:?}", written.first_error());

    let (tx, rx) = oneshot::channel::<IoOutcome>();
    let coordinator = IoCoordinator::new(1, move |outcome| {
        let _ = tx.send(outcome);
    });
    assert_ok!(reader.read(assert_ok!(pool.acquire()), bytes.len(), path, position, coordinator));
    let read = rx.await.unwrap();
    assert!(read.is_success(), "read failed: {:?}", read.first_error());
    read.into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_payload_round_trips_as_one_buffer() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let len = rand::thread_rng().gen_range(1..=MAX_LEN);
    let bytes = random_bytes(len);

    let back = single_buffer_round_trip(&dir.path().join("single.data"), &bytes).await;
    assert_eq!(back.len(), bytes.len());
    assert!(back == bytes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_payload_round_trips_as_multi_part() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi.data");
    let pool = BufferPool::new(64 * 1024, 4, 256);
    let handles = Arc::new(HandlePool::new(4));
    let writer = StorageWriter::new(Arc::clone(&handles), Handle::current());
    let reader = StorageReader::new(handles, Handle::current());

    for _ in 0..3 {
        let len = rand::thread_rng().gen_range(1..=MAX_LEN);
        let bytes = random_bytes(len);

        let outcome = assert_ok!(writer.write_bytes(&pool, &bytes, &path).await);
        assert!(outcome.is_success());
        assert_eq!(outcome.parts.len(), pool.buffers_for(len));
        assert!(outcome.parts.windows(2).all(|w| w[0].index < w[1].index));

        let position = outcome.position().unwrap();
        let back = assert_ok!(reader.read_bytes(&pool, &path, position, len as u64).await);
        assert!(back == bytes, "round trip of {len} bytes at {position} differs");
    }
    assert_eq!(pool.stats().outstanding, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_transfers_are_resubmitted_silently() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.data");
    let ops = Arc::new(ShortTransferOps {
        chunk: 7,
        calls: AtomicUsize::new(0),
    });
    let handles = Arc::new(HandlePool::new(2));
    let writer = StorageWriter::with_file_ops(Arc::clone(&handles), ops.clone(), Handle::current());
    let reader = StorageReader::with_file_ops(handles, ops.clone(), Handle::current());
    let pool = BufferPool::new(50, 0, 8);

    let bytes = random_bytes(300);
    let outcome = assert_ok!(writer.write_bytes(&pool, &bytes, &path).await);
    assert!(outcome.is_success());
    assert_eq!(outcome.failed, 0);
    assert!(ops.calls.load(Ordering::Relaxed) >= 300 / 7);

    let back = assert_ok!(reader.read_bytes(&pool, &path, 0, 300).await);
    assert_eq!(back, bytes);
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
}

#[tokio::test]
async fn handle_closed_under_pressure_is_reopened() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let handles = Arc::new(HandlePool::new(1));
    let writer = StorageWriter::new(Arc::clone(&handles), Handle::current());
    let pool = BufferPool::new(16, 0, 16);
    let a = dir.path().join("a.data");
    let b = dir.path().join("b.data");

    // On a current-thread runtime neither request runs before the await below, so
    // submitting to `b` closes the handle the `a` request was issued against.
    let (tx_a, rx_a) = oneshot::channel::<IoOutcome>();
    assert_ok!(writer.write_all(assert_ok!(pool.acquire_filled(b"first file")), &a, move |o| {
        let _ = tx_a.send(o);
    }));
    let (tx_b, rx_b) = oneshot::channel::<IoOutcome>();
    assert_ok!(writer.write_all(assert_ok!(pool.acquire_filled(b"second file")), &b, move |o| {
        let _ = tx_b.send(o);
    }));
    assert_eq!(handles.open_count(), 1);

    let (outcome_a, outcome_b) = (rx_a.await.unwrap(), rx_b.await.unwrap());
    assert!(outcome_a.is_success(), "{:?}", outcome_a.first_error());
    assert!(outcome_b.is_success(), "{:?}", outcome_b.first_error());
    assert!(handles.open_count() <= 1);
    assert_eq!(std::fs::read(&a).unwrap(), b"first file");
    assert_eq!(std::fs::read(&b).unwrap(), b"second file");
}

#[tokio::test]
async fn read_handle_closed_under_pressure_is_reopened() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.data");
    let b = dir.path().join("b.data");
    let (bytes_a, bytes_b) = (random_bytes(100), random_bytes(60));
    std::fs::write(&a, &bytes_a).unwrap();
    std::fs::write(&b, &bytes_b).unwrap();

    let handles = Arc::new(HandlePool::new(1));
    let reader = StorageReader::new(Arc::clone(&handles), Handle::current());
    let pool = BufferPool::new(32, 0, 16);

    // As with writes, submitting the read of `b` closes the handle the `a` read was issued
    // against before either request runs.
    let (tx_a, rx_a) = oneshot::channel::<IoOutcome>();
    assert_ok!(reader.read_all(&pool, &a, 0, 100, move |o| {
        let _ = tx_a.send(o);
    }));
    let (tx_b, rx_b) = oneshot::channel::<IoOutcome>();
    assert_ok!(reader.read_all(&pool, &b, 0, 60, move |o| {
        let _ = tx_b.send(o);
    }));
    assert_eq!(handles.open_count(), 1);

    let (outcome_a, outcome_b) = (rx_a.await.unwrap(), rx_b.await.unwrap());
    assert!(outcome_a.is_success(), "{:?}", outcome_a.first_error());
    assert!(outcome_b.is_success(), "{:?}", outcome_b.first_error());
    assert_eq!(outcome_a.into_bytes(), bytes_a);
    assert_eq!(outcome_b.into_bytes(), bytes_b);
    assert!(handles.open_count() <= 1);
    assert!(handles.registered_count() <= 1);
    assert_eq!(pool.stats().outstanding, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_do_not_create_or_pin_files() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let handles = Arc::new(HandlePool::new(2));
    let reader = StorageReader::new(Arc::clone(&handles), Handle::current());
    let pool = BufferPool::new(16, 0, 4);

    let missing = dir.path().join("missing.data");
    let result = reader.read_bytes(&pool, &missing, 0, 8).await;
    assert!(matches!(result, Err(StorageError::Handle(HandleError::Io(ref e))) if e.kind() == io::ErrorKind::NotFound));
    assert!(!missing.exists());
    assert_eq!(handles.registered_count(), 0);

    for i in 0..5 {
        let path = dir.path().join(format!("{i}.data"));
        std::fs::write(&path, [i as u8; 8]).unwrap();
        assert_eq!(assert_ok!(reader.read_bytes(&pool, &path, 0, 8).await), vec![i as u8; 8]);
    }
    assert!(handles.registered_count() <= 2);
    assert_eq!(pool.stats().outstanding, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alternating_files_with_one_slot() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let handles = Arc::new(HandlePool::new(1));
    let writer = StorageWriter::new(Arc::clone(&handles), Handle::current());
    let pool = BufferPool::new(8, 0, 8);
    let paths: Vec<_> = (0..3).map(|i| dir.path().join(format!("{i}.data"))).collect();

    for round in 0..4u8 {
        for path in &paths {
            let outcome = assert_ok!(writer.write_bytes(&pool, &[round; 5], path).await);
            assert_eq!(outcome.position(), Some(u64::from(round) * 5));
        }
    }
    for path in &paths {
        let expected: Vec<u8> = (0..4u8).flat_map(|round| [round; 5]).collect();
        assert_eq!(std::fs::read(path).unwrap(), expected);
    }
    assert_eq!(handles.registered_count(), 3);
    assert_eq!(handles.open_count(), 1);
}

#[tokio::test]
async fn no_handle_slots_fails_synchronously() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let writer = StorageWriter::new(Arc::new(HandlePool::new(0)), Handle::current());
    let pool = BufferPool::new(8, 0, 8);
    let result = writer.write_bytes(&pool, b"never", &dir.path().join("x.data")).await;
    assert!(matches!(result, Err(StorageError::Handle(_))));
    assert_eq!(pool.stats().outstanding, 0);
}
