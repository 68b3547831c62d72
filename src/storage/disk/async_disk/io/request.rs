//! One constituent I/O request and the loop that drives it to completion.
//!
//! ```text
//!              submit
//!                │
//!                ▼
//!   ┌──────────────────────────┐  transferred < len   ┌──────────────────────────┐
//!   │ Remaining { offset, len }│ ───────────────────▶ │ Remaining { offset + n,  │
//!   └──────────────────────────┘                      │             len - n }    │
//!        │         ▲                                  └──────────────────────────┘
//!        │         │ handle closed under pressure: reopen, same state
//!        │         └─────────────────────────────
//!        │ transferred == len
//!        ▼
//!      Done ──▶ coordinator.mark_success
//! ```
//!
//! Partial transfers and handles closed by the pool are recovered inside the loop and never
//! reach the coordinator; only a device error, a zero-progress transfer or exhausting the
//! reopen attempts marks the request failed.

use std::io;
use std::sync::Arc;

use log::trace;

use crate::common::config::{MAX_REOPEN_ATTEMPTS, REOPEN_BACKOFF};
use crate::common::exception::{HandleError, StorageError};
use crate::storage::disk::async_disk::cache::handle_pool::HandlePool;
use crate::storage::disk::async_disk::io::coordinator::{IoCoordinator, PartOutcome};
use crate::storage::disk::async_disk::io::file_handle::AsyncFileHandle;
use crate::storage::disk::async_disk::io::file_ops::FileOps;
use crate::storage::disk::async_disk::memory::memory_pool::PooledBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Remaining { offset: u64, len: usize },
    Done,
}

impl RequestState {
    pub fn new(offset: u64, len: usize) -> Self {
        if len == 0 {
            RequestState::Done
        } else {
            RequestState::Remaining { offset, len }
        }
    }

    /// State after `transferred` more bytes went through.
    pub fn advance(self, transferred: usize) -> Self {
        match self {
            RequestState::Remaining { offset, len } if transferred < len => RequestState::Remaining {
                offset: offset + transferred as u64,
                len: len - transferred,
            },
            _ => RequestState::Done,
        }
    }
}

pub struct IoRequest {
    pub(crate) kind: IoKind,
    pub(crate) index: usize,
    pub(crate) buffer: PooledBuffer,
    pub(crate) position: u64,
    pub(crate) size: usize,
    pub(crate) handle: Arc<AsyncFileHandle>,
    pub(crate) coordinator: Arc<IoCoordinator>,
}

impl IoRequest {
    /// Drives the request until it is drained or fails, then reports to the coordinator.
    pub(crate) async fn execute(self, handles: Arc<HandlePool>, ops: Arc<dyn FileOps>) {
        let IoRequest {
            kind,
            index,
            buffer,
            position,
            size,
            handle,
            coordinator,
        } = self;

        let part = PartOutcome::new(index, position, size);
        // Returns with the lease released: the continuation may issue follow-up I/O and the
        // handle must be evictable by then.
        let result = drive(kind, buffer, position, size, handle, &handles, ops).await;

        match result {
            Ok(buffer) if kind == IoKind::Read => coordinator.mark_success(part.with_buffer(buffer)),
            Ok(buffer) => {
                drop(buffer);
                coordinator.mark_success(part)
            }
            Err(e) => coordinator.mark_failed(part, &e),
        }
    }
}

async fn drive(
    kind: IoKind,
    mut buffer: PooledBuffer,
    position: u64,
    size: usize,
    mut handle: Arc<AsyncFileHandle>,
    handles: &HandlePool,
    ops: Arc<dyn FileOps>,
) -> Result<PooledBuffer, StorageError> {
    let mut state = RequestState::new(position, size);
    let mut reopen_attempts = 0;
    let mut _lease = handle.begin_io();

    while let RequestState::Remaining { offset, len } = state {
        let file = match handle.file() {
            Ok(file) => file,
            Err(HandleError::Closed(_)) => {
                match handles.reopen(&handle) {
                    Ok(current) => {
                        if !Arc::ptr_eq(&current, &handle) {
                            _lease = current.begin_io();
                            handle = current;
                        }
                        trace!("Reopened {:?} for request at {}", handle.path(), offset);
                    }
                    Err(HandleError::Exhausted { .. }) if reopen_attempts < MAX_REOPEN_ATTEMPTS => {
                        reopen_attempts += 1;
                        tokio::time::sleep(REOPEN_BACKOFF).await;
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let done = size - len;
        let ops = Arc::clone(&ops);
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let range = done..done + len;
            let result = match kind {
                IoKind::Write => ops.write_at(&file, &buffer.as_slice()[range], offset),
                IoKind::Read => ops.read_at(&file, &mut buffer.as_mut_slice()[range], offset),
            };
            (buffer, result)
        })
        .await
        .map_err(|e| StorageError::TaskAborted(e.to_string()))?;
        buffer = returned;

        match result {
            Ok(0) => {
                let error = match kind {
                    IoKind::Write => io::Error::new(io::ErrorKind::WriteZero, "write made no progress"),
                    IoKind::Read => io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file"),
                };
                return Err(error.into());
            }
            Ok(transferred) => {
                if transferred < len {
                    trace!("Partial {:?} of {} / {} bytes at {}, resubmitting", kind, transferred, len, offset);
                }
                state = state.advance(transferred);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buffer)
}
