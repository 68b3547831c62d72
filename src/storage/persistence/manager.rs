//! # Persistence Manager
//!
//! Owns the I/O resources shared by all jobs (buffer pool, handle pool, writer and reader)
//! and drives the two-stage write of every persisted record:
//!
//! ```text
//!   persist(job, record)
//!        │ encode, lease buffers (exhaustion fails here, synchronously)
//!        ▼
//!   data container ── write_all ──▶ coordinator
//!                                      │ failed: job.fail()
//!                                      ▼ ok: offset, length
//!                      ┌── index_lock ─────────────────────────┐
//!                      │ PersistentIndexTree::put              │
//!                      │ index container ── write_all (frame)  │
//!                      └───────────────────────────────────────┘
//!                                      │ failed: remove tree entry, job.fail()
//!                                      ▼ ok: job.succeed(length)
//! ```
//!
//! Only records whose data *and* index frame were written keep a tree entry. Closing a job
//! waits until every registered write has reached one of the two terminal calls, then
//! finalizes both containers. The job stays registered until then, so the container cannot
//! be resumed while its last frames are still landing.
//!
//! Index frames are a little-endian `u32` magic, body length and body checksum followed by
//! a bincode [`IndexFrame`]. A frame whose write failed leaves its reserved range unwritten;
//! replay skips such ranges up to the next intact frame.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use xxhash_rust::xxh3::xxh3_64;

use crate::common::config::{
    ContainerId, DATA_FILE_EXTENSION, DataPlaneConfig, INDEX_FILE_EXTENSION, INDEX_FRAME_HEADER_SIZE,
    INDEX_FRAME_MAGIC, storage_bincode_config,
};
use crate::common::exception::StorageError;
use crate::storage::disk::async_disk::cache::handle_pool::HandlePool;
use crate::storage::disk::async_disk::io::coordinator::IoOutcome;
use crate::storage::disk::async_disk::io::file_ops::{FileOps, PositionalFileOps};
use crate::storage::disk::async_disk::memory::memory_pool::BufferPool;
use crate::storage::disk::async_disk::storage_reader::StorageReader;
use crate::storage::disk::async_disk::storage_writer::StorageWriter;
use crate::storage::index::branch_indexer::BranchIndexer;
use crate::storage::index::persistent_tree::PersistentIndexTree;
use crate::storage::index::storage_leaf::StorageDescriptor;
use crate::storage::persistence::job::{IndexFrame, JobHandle, JobReport, JobState};
use crate::types_db::record::Record;

pub struct PersistenceManager {
    root: PathBuf,
    pool: BufferPool,
    handles: Arc<HandlePool>,
    writer: StorageWriter,
    reader: StorageReader,
    jobs: Mutex<HashMap<ContainerId, JobHandle>>,
}

impl PersistenceManager {
    pub fn new(config: &DataPlaneConfig, runtime: Handle) -> Self {
        Self::with_file_ops(config, Arc::new(PositionalFileOps), runtime)
    }

    /// Manager whose file I/O goes through `ops`.
    pub fn with_file_ops(config: &DataPlaneConfig, ops: Arc<dyn FileOps>, runtime: Handle) -> Self {
        let handles = Arc::new(HandlePool::new(config.max_open_handles));
        Self {
            root: config.storage_root.clone(),
            pool: BufferPool::new(config.buffer_size, config.pool_min_capacity, config.pool_max_capacity),
            writer: StorageWriter::with_file_ops(Arc::clone(&handles), Arc::clone(&ops), runtime.clone()),
            reader: StorageReader::with_file_ops(Arc::clone(&handles), ops, runtime),
            handles,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.root
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn handles(&self) -> &Arc<HandlePool> {
        &self.handles
    }

    pub fn data_path(&self, container_id: ContainerId) -> PathBuf {
        self.root.join(format!("{container_id}.{DATA_FILE_EXTENSION}"))
    }

    pub fn index_path(&self, container_id: ContainerId) -> PathBuf {
        self.root.join(format!("{container_id}.{INDEX_FILE_EXTENSION}"))
    }

    pub fn job(&self, container_id: ContainerId) -> Option<JobHandle> {
        self.jobs.lock().get(&container_id).cloned()
    }

    pub fn open_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn job_handles(&self) -> Vec<JobHandle> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Checks that `job` was begun by this manager and has not been closed.
    fn check_owned(&self, job: &JobHandle) -> Result<(), StorageError> {
        let owned = self
            .jobs
            .lock()
            .get(&job.state.container_id)
            .is_some_and(|open| Arc::ptr_eq(&open.state, &job.state));
        match (owned, job.is_closed()) {
            (_, true) => Err(StorageError::JobClosed(job.state.container_id)),
            (false, false) => Err(StorageError::UnknownJob(job.state.container_id)),
            (true, false) => Ok(()),
        }
    }

    /// Opens a job on container `container_id`. An existing container is resumed: its index
    /// is replayed and new records are appended after the existing data. Fails with
    /// `JobExists` while a job on the container is open or still closing.
    pub async fn begin_job(&self, container_id: ContainerId) -> Result<JobHandle, StorageError> {
        if self.jobs.lock().contains_key(&container_id) {
            return Err(StorageError::JobExists(container_id));
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let index_path = self.index_path(container_id);
        let tree = match tokio::fs::read(&index_path).await {
            Ok(bytes) => {
                let (tree, valid) = replay_frames(&bytes)?;
                if valid < bytes.len() {
                    truncate(&index_path, valid as u64).await?;
                }
                tree
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => PersistentIndexTree::new(BranchIndexer::storage_default()),
            Err(e) => return Err(e.into()),
        };

        let job = JobHandle {
            state: Arc::new(JobState::new(container_id, self.data_path(container_id), index_path, tree)),
        };
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&container_id) {
            return Err(StorageError::JobExists(container_id));
        }
        jobs.insert(container_id, job.clone());
        info!("Began persistence job {} with {} indexed records", container_id, job.state.index.len());
        Ok(job)
    }

    /// Submits `record` for persistence and returns without waiting for the I/O.
    ///
    /// Pool exhaustion and handle exhaustion are reported here. Device errors surface later
    /// through the job's [`WritingStatus`](super::job::WritingStatus) and report.
    pub fn persist(&self, job: &JobHandle, record: Arc<Record>) -> Result<(), StorageError> {
        self.check_owned(job)?;
        let state = Arc::clone(&job.state);
        if !state.begin_write() {
            return Err(StorageError::JobClosed(state.container_id));
        }

        let buffers = match record
            .encode_to_vec()
            .map_err(StorageError::from)
            .and_then(|bytes| Ok(self.pool.acquire_filled(&bytes)?))
        {
            Ok(buffers) => buffers,
            Err(e) => {
                state.abandon();
                return Err(e);
            }
        };

        let sink = IndexSink {
            pool: self.pool.clone(),
            writer: self.writer.clone(),
        };
        let data_path = state.data_path.clone();
        self.writer
            .write_all(buffers, &data_path, move |outcome| sink.data_written(&state, &record, outcome))?;
        Ok(())
    }

    /// Closes the job once all of its writes have completed and finalizes its containers.
    pub async fn close_job(&self, job: JobHandle) -> Result<JobReport, StorageError> {
        self.check_owned(&job)?;
        let state = Arc::clone(&job.state);
        if !state.close() {
            return Err(StorageError::JobClosed(state.container_id));
        }
        state.drained().await;

        let handles = Arc::clone(&self.handles);
        let data_path = state.data_path.clone();
        let index_path = state.index_path.clone();
        let finalized = tokio::task::spawn_blocking(move || {
            handles.finalize(&data_path)?;
            handles.finalize(&index_path)
        })
        .await;
        self.jobs.lock().remove(&state.container_id);
        finalized.map_err(|e| StorageError::TaskAborted(e.to_string()))??;

        let report = state.report();
        info!(
            "Closed persistence job {}: {} written, {} failed, {} bytes",
            report.container_id, report.records_written, report.records_failed, report.bytes_written
        );
        Ok(report)
    }

    /// Rebuilds the index of container `container_id` from its index file.
    pub async fn load_index(&self, container_id: ContainerId) -> Result<PersistentIndexTree, StorageError> {
        let bytes = tokio::fs::read(self.index_path(container_id)).await?;
        let (tree, _) = replay_frames(&bytes)?;
        Ok(tree)
    }

    /// Reads back and decodes the record `descriptor` points at.
    pub async fn read_record(&self, container_id: ContainerId, descriptor: &StorageDescriptor) -> Result<Record, StorageError> {
        let bytes = self
            .reader
            .read_bytes(&self.pool, &self.data_path(container_id), descriptor.offset, descriptor.length)
            .await?;
        Ok(Record::decode_from_slice(&bytes)?)
    }
}

/// What the data-write continuation needs to emit the index frame.
struct IndexSink {
    pool: BufferPool,
    writer: StorageWriter,
}

impl IndexSink {
    fn data_written(&self, state: &Arc<JobState>, record: &Record, outcome: IoOutcome) {
        let (true, Some(offset)) = (outcome.is_success(), outcome.position()) else {
            return state.fail();
        };
        let length = outcome.length();

        let _order = state.index_lock.lock();
        let descriptor = match state.index.put(record.header(), offset, length) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Record {} written to {:?} but not indexed: {}", record.id(), state.data_path, e);
                return state.fail();
            }
        };

        let frame = IndexFrame {
            header: record.header().clone(),
            descriptor,
        };
        let buffers = match encode_frame(&frame).and_then(|bytes| Ok(self.pool.acquire_filled(&bytes)?)) {
            Ok(buffers) => buffers,
            Err(e) => {
                error!("Dropping index entry of record {}: {}", record.id(), e);
                state.index.get_and_remove(record.header());
                return state.fail();
            }
        };

        let job = Arc::clone(state);
        let header = frame.header;
        // A synchronous failure has already run the continuation below.
        let _ = self.writer.write_all(buffers, &state.index_path, move |outcome| {
            if outcome.is_success() {
                job.succeed(length);
            } else {
                job.index.get_and_remove(&header);
                job.fail();
            }
        });
    }
}

fn encode_frame(frame: &IndexFrame) -> Result<Vec<u8>, StorageError> {
    seal_frame(&bincode::encode_to_vec(frame, storage_bincode_config())?)
}

fn seal_frame(body: &[u8]) -> Result<Vec<u8>, StorageError> {
    let len = u32::try_from(body.len())
        .map_err(|_| StorageError::CorruptIndex(format!("index frame of {} bytes is too large", body.len())))?;
    let mut bytes = Vec::with_capacity(INDEX_FRAME_HEADER_SIZE + body.len());
    bytes.extend_from_slice(&INDEX_FRAME_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(&frame_checksum(body).to_le_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

fn frame_checksum(body: &[u8]) -> u32 {
    xxh3_64(body) as u32
}

/// Body and total length of the intact frame at the start of `bytes`, if there is one.
fn parse_frame(bytes: &[u8]) -> Option<(&[u8], usize)> {
    let (header, rest) = bytes.split_first_chunk::<INDEX_FRAME_HEADER_SIZE>()?;
    let field = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    if field(0) != INDEX_FRAME_MAGIC {
        return None;
    }
    let len = field(4) as usize;
    let body = rest.get(..len)?;
    (frame_checksum(body) == field(8)).then_some((body, INDEX_FRAME_HEADER_SIZE + len))
}

/// Start of the first intact frame at or after `from`.
fn next_frame_start(bytes: &[u8], from: usize) -> Option<usize> {
    let magic = INDEX_FRAME_MAGIC.to_le_bytes();
    (from..bytes.len().saturating_sub(INDEX_FRAME_HEADER_SIZE - 1))
        .filter(|&at| bytes[at..at + magic.len()] == magic)
        .find(|&at| parse_frame(&bytes[at..]).is_some())
}

/// Replays index frames into a fresh tree. Returns the tree and the end of the last intact
/// frame. Ranges left unwritten by failed frame writes are skipped, and so is anything after
/// the last intact frame. An intact frame that does not decode or repeats an id is corrupt.
fn replay_frames(bytes: &[u8]) -> Result<(PersistentIndexTree, usize), StorageError> {
    let tree = PersistentIndexTree::new(BranchIndexer::storage_default());
    let mut offset = 0;
    let mut valid = 0;
    while offset < bytes.len() {
        let Some((body, consumed)) = parse_frame(&bytes[offset..]) else {
            match next_frame_start(bytes, offset + 1) {
                Some(next) => {
                    warn!("Skipping {} bytes of unwritten index frames at {}", next - offset, offset);
                    offset = next;
                    continue;
                }
                None => {
                    warn!("Ignoring incomplete index tail of {} bytes at {}", bytes.len() - offset, offset);
                    break;
                }
            }
        };

        let (frame, _): (IndexFrame, usize) = bincode::decode_from_slice(body, storage_bincode_config())
            .map_err(|e| StorageError::CorruptIndex(format!("frame at {offset}: {e}")))?;
        tree.put(&frame.header, frame.descriptor.offset, frame.descriptor.length)
            .map_err(|e| StorageError::CorruptIndex(format!("frame at {offset}: {e}")))?;
        offset += consumed;
        valid = offset;
    }
    Ok((tree, valid))
}

async fn truncate(path: &Path, len: u64) -> Result<(), StorageError> {
    warn!("Truncating {:?} to its last intact frame at {}", path, len);
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    Ok(())
}
