use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::common::exception::StorageError;
use crate::storage::disk::async_disk::cache::handle_pool::HandlePool;
use crate::storage::disk::async_disk::io::coordinator::{IoCoordinator, IoOutcome, PartOutcome};
use crate::storage::disk::async_disk::io::file_ops::{FileOps, PositionalFileOps};
use crate::storage::disk::async_disk::io::request::{IoKind, IoRequest};
use crate::storage::disk::async_disk::memory::memory_pool::{BufferPool, PooledBuffer};

/// Read-side mirror of [`StorageWriter`](super::storage_writer::StorageWriter): fills leased
/// buffers from absolute positions and hands them back through the coordinator outcome,
/// ordered by part index.
#[derive(Clone)]
pub struct StorageReader {
    handles: Arc<HandlePool>,
    ops: Arc<dyn FileOps>,
    runtime: Handle,
}

impl StorageReader {
    pub fn new(handles: Arc<HandlePool>, runtime: Handle) -> Self {
        Self::with_file_ops(handles, Arc::new(PositionalFileOps), runtime)
    }

    pub fn with_file_ops(handles: Arc<HandlePool>, ops: Arc<dyn FileOps>, runtime: Handle) -> Self {
        Self { handles, ops, runtime }
    }

    /// Reads `len` bytes at `position` of `path` into `buffer` as part 0 of `coordinator`.
    /// `len` must fit the buffer. A missing file fails without being created.
    pub fn read(
        &self,
        buffer: PooledBuffer,
        len: usize,
        path: &Path,
        position: u64,
        coordinator: Arc<IoCoordinator>,
    ) -> Result<(), StorageError> {
        self.read_part(0, buffer, len, path, position, coordinator)
    }

    pub fn read_part(
        &self,
        index: usize,
        mut buffer: PooledBuffer,
        len: usize,
        path: &Path,
        position: u64,
        coordinator: Arc<IoCoordinator>,
    ) -> Result<(), StorageError> {
        if len > buffer.capacity() {
            let e = StorageError::BufferTooSmall {
                requested: len,
                capacity: buffer.capacity(),
            };
            coordinator.mark_failed(PartOutcome::new(index, position, len), &e);
            return Err(e);
        }
        buffer.set_len(len);
        let size = buffer.len();
        let handle = match self.handles.get_read_handle(path) {
            Ok(handle) => handle,
            Err(e) => {
                coordinator.mark_failed(PartOutcome::new(index, position, size), &e);
                return Err(e.into());
            }
        };
        self.submit(IoRequest {
            kind: IoKind::Read,
            index,
            buffer,
            position,
            size,
            handle,
            coordinator,
        });
        Ok(())
    }

    /// Reads `[position, position + size)` of `path` into as many pooled buffers as needed.
    /// Fails synchronously, without submitting anything, when the pool cannot lease them.
    pub fn read_all<F>(
        &self,
        pool: &BufferPool,
        path: &Path,
        position: u64,
        size: u64,
        continuation: F,
    ) -> Result<Arc<IoCoordinator>, StorageError>
    where
        F: FnOnce(IoOutcome) + Send + 'static,
    {
        let size = usize::try_from(size)
            .map_err(|_| StorageError::CorruptIndex(format!("read length {size} exceeds address space")))?;
        let buffers = pool.acquire_many(pool.buffers_for(size))?;
        let coordinator = IoCoordinator::new(buffers.len(), continuation);

        let chunk = pool.buffer_size();
        let mut offset = position;
        let mut remaining = size;
        let mut first_error = None;
        for (index, buffer) in buffers.into_iter().enumerate() {
            let len = remaining.min(chunk);
            if let Err(e) = self.read_part(index, buffer, len, path, offset, Arc::clone(&coordinator)) {
                first_error.get_or_insert(e);
            }
            offset += len as u64;
            remaining -= len;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(coordinator),
        }
    }

    /// Reads a byte range and waits for it; any failed part fails the whole read.
    pub async fn read_bytes(&self, pool: &BufferPool, path: &Path, position: u64, size: u64) -> Result<Vec<u8>, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.read_all(pool, path, position, size, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        let outcome = rx
            .await
            .map_err(|_| StorageError::TaskAborted("read continuation dropped".into()))?;
        if !outcome.is_success() {
            return Err(StorageError::Incomplete {
                expected: outcome.succeeded + outcome.failed,
                failed: outcome.failed,
            });
        }
        Ok(outcome.into_bytes())
    }

    fn submit(&self, request: IoRequest) {
        let handles = Arc::clone(&self.handles);
        let ops = Arc::clone(&self.ops);
        self.runtime.spawn(request.execute(handles, ops));
    }
}
