use std::path::Path;
use std::sync::Arc;

use log::debug;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::common::exception::StorageError;
use crate::storage::disk::async_disk::cache::handle_pool::HandlePool;
use crate::storage::disk::async_disk::io::coordinator::{IoCoordinator, IoOutcome, PartOutcome};
use crate::storage::disk::async_disk::io::file_ops::{FileOps, PositionalFileOps};
use crate::storage::disk::async_disk::io::request::{IoKind, IoRequest};
use crate::storage::disk::async_disk::memory::memory_pool::{BufferPool, PooledBuffer};

/// Appends leased buffers to files through the handle pool.
///
/// Submission is non-blocking: every request is driven by a task on the runtime and
/// reports to its coordinator from there. A failure detected while submitting (no handle
/// slot, handle open error) is recorded on the coordinator as a failed part *and* returned,
/// so the continuation still fires exactly once.
#[derive(Clone)]
pub struct StorageWriter {
    handles: Arc<HandlePool>,
    ops: Arc<dyn FileOps>,
    runtime: Handle,
}

impl StorageWriter {
    pub fn new(handles: Arc<HandlePool>, runtime: Handle) -> Self {
        Self::with_file_ops(handles, Arc::new(PositionalFileOps), runtime)
    }

    pub fn with_file_ops(handles: Arc<HandlePool>, ops: Arc<dyn FileOps>, runtime: Handle) -> Self {
        Self { handles, ops, runtime }
    }

    pub fn handles(&self) -> &Arc<HandlePool> {
        &self.handles
    }

    /// Reserves a range at the end of `path` and writes `buffer` there as part 0 of
    /// `coordinator`. Returns the reserved position.
    pub fn write(&self, buffer: PooledBuffer, path: &Path, coordinator: Arc<IoCoordinator>) -> Result<u64, StorageError> {
        self.write_part(0, buffer, path, coordinator)
    }

    /// Like [`StorageWriter::write`] for part `index` of a multi-part operation.
    pub fn write_part(
        &self,
        index: usize,
        buffer: PooledBuffer,
        path: &Path,
        coordinator: Arc<IoCoordinator>,
    ) -> Result<u64, StorageError> {
        let size = buffer.len();
        let handle = match self.handles.get_handle(path) {
            Ok(handle) => handle,
            Err(e) => {
                coordinator.mark_failed(PartOutcome::new(index, 0, size), &e);
                return Err(e.into());
            }
        };
        let position = handle.reserve_writing_position(size as u64);
        self.submit(IoRequest {
            kind: IoKind::Write,
            index,
            buffer,
            position,
            size,
            handle,
            coordinator,
        });
        Ok(position)
    }

    /// Writes `buffers` back to back at one reserved range of `path`. The continuation runs
    /// once after every buffer has been written or has failed.
    pub fn write_all<F>(&self, buffers: Vec<PooledBuffer>, path: &Path, continuation: F) -> Result<Arc<IoCoordinator>, StorageError>
    where
        F: FnOnce(IoOutcome) + Send + 'static,
    {
        let coordinator = IoCoordinator::new(buffers.len(), continuation);
        let total: u64 = buffers.iter().map(|buffer| buffer.len() as u64).sum();

        let handle = match self.handles.get_handle(path) {
            Ok(handle) => handle,
            Err(e) => {
                for (index, buffer) in buffers.iter().enumerate() {
                    coordinator.mark_failed(PartOutcome::new(index, 0, buffer.len()), &e);
                }
                return Err(e.into());
            }
        };

        let mut position = handle.reserve_writing_position(total);
        debug!("Writing {} bytes in {} parts to {:?} at {}", total, buffers.len(), path, position);
        for (index, buffer) in buffers.into_iter().enumerate() {
            let size = buffer.len();
            self.submit(IoRequest {
                kind: IoKind::Write,
                index,
                buffer,
                position,
                size,
                handle: Arc::clone(&handle),
                coordinator: Arc::clone(&coordinator),
            });
            position += size as u64;
        }
        Ok(coordinator)
    }

    /// Leases buffers for `bytes`, writes them and waits for the outcome.
    pub async fn write_bytes(&self, pool: &BufferPool, bytes: &[u8], path: &Path) -> Result<IoOutcome, StorageError> {
        let buffers = pool.acquire_filled(bytes)?;
        let (tx, rx) = oneshot::channel();
        self.write_all(buffers, path, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await
            .map_err(|_| StorageError::TaskAborted("write continuation dropped".into()))
    }

    fn submit(&self, request: IoRequest) {
        let handles = Arc::clone(&self.handles);
        let ops = Arc::clone(&self.ops);
        self.runtime.spawn(request.execute(handles, ops));
    }
}
