use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::common::config::ContainerId;
use crate::storage::index::persistent_tree::PersistentIndexTree;
use crate::storage::index::storage_leaf::StorageDescriptor;
use crate::types_db::record::RecordHeader;

/// One entry of an index container: the header the record was classified by and where its
/// bytes landed in the data container.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct IndexFrame {
    pub header: RecordHeader,
    pub descriptor: StorageDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritingStatus {
    /// No write in flight and none failed so far.
    Idle,
    Writing,
    /// At least one record of the job failed to persist.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Complete,
    Partial,
}

/// Summary returned when a job is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub container_id: ContainerId,
    pub records_written: u64,
    pub records_failed: u64,
    pub bytes_written: u64,
    pub status: JobStatus,
}

pub(crate) struct JobState {
    pub(crate) container_id: ContainerId,
    pub(crate) data_path: PathBuf,
    pub(crate) index_path: PathBuf,
    pub(crate) index: Arc<PersistentIndexTree>,
    /// Serializes tree insertion with index frame reservation so frames land in tree order.
    pub(crate) index_lock: Mutex<()>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    written: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    drained: Notify,
}

impl JobState {
    pub(crate) fn new(container_id: ContainerId, data_path: PathBuf, index_path: PathBuf, index: PersistentIndexTree) -> Self {
        Self {
            container_id,
            data_path,
            index_path,
            index: Arc::new(index),
            index_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    /// Registers a write. Fails when the job is already closed.
    pub(crate) fn begin_write(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            self.finish();
            return false;
        }
        true
    }

    /// Ends a write that never reached the I/O layer; not counted in the report.
    pub(crate) fn abandon(&self) {
        self.finish();
    }

    pub(crate) fn succeed(&self, bytes: u64) {
        self.written.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.finish();
    }

    pub(crate) fn fail(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.finish();
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Marks the job closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Resolves once every registered write has reached its continuation.
    pub(crate) async fn drained(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn report(&self) -> JobReport {
        let records_failed = self.failed.load(Ordering::Acquire);
        JobReport {
            container_id: self.container_id,
            records_written: self.written.load(Ordering::Acquire),
            records_failed,
            bytes_written: self.bytes.load(Ordering::Acquire),
            status: if records_failed == 0 { JobStatus::Complete } else { JobStatus::Partial },
        }
    }
}

/// Caller's reference to an open persistence job.
#[derive(Clone)]
pub struct JobHandle {
    pub(crate) state: Arc<JobState>,
}

impl JobHandle {
    pub fn container_id(&self) -> ContainerId {
        self.state.container_id
    }

    pub fn data_path(&self) -> &Path {
        &self.state.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.state.index_path
    }

    /// Index entries of every record persisted so far.
    pub fn index(&self) -> Arc<PersistentIndexTree> {
        Arc::clone(&self.state.index)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn writing_status(&self) -> WritingStatus {
        if self.state.failed.load(Ordering::Acquire) > 0 {
            WritingStatus::Failed
        } else if self.state.in_flight.load(Ordering::Acquire) > 0 {
            WritingStatus::Writing
        } else {
            WritingStatus::Idle
        }
    }

    /// Counters so far; final once the job is closed.
    pub fn report(&self) -> JobReport {
        self.state.report()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("container_id", &self.state.container_id)
            .field("data_path", &self.state.data_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
