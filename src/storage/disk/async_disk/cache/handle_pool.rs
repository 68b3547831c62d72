//! # File Handle Pool
//!
//! Bounds how many files the storage layer keeps open at once. Handles are created per
//! path on first use. Writable handles stay registered (with their append cursor) after
//! their descriptor is closed, so a closed handle can be reopened transparently; read-only
//! handles are dropped from the registry when closed.
//!
//! ```text
//!   get_handle(path)
//!        │
//!        ├── registered and open ───────────────▶ touch, return
//!        │
//!        ├── open_count < max ──────────────────▶ open, touch, return
//!        │
//!        └── at capacity ──▶ least recently used idle handle?
//!                               │ yes: close it, open path, return
//!                               │ no:  HandleError::Exhausted
//! ```
//!
//! Recency is a logical clock advanced on every access, which gives strict LRU ordering
//! independent of wall-clock resolution. Handles with operations in flight are never
//! chosen for eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::exception::HandleError;
use crate::storage::disk::async_disk::io::file_handle::AsyncFileHandle;

struct PoolState {
    handles: HashMap<PathBuf, Arc<AsyncFileHandle>>,
    open: usize,
}

pub struct HandlePool {
    max_open: usize,
    state: Mutex<PoolState>,
    clock: AtomicU64,
}

impl HandlePool {
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open,
            state: Mutex::new(PoolState {
                handles: HashMap::new(),
                open: 0,
            }),
            clock: AtomicU64::new(0),
        }
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the open handle for `path`, opening it for writing (and evicting the least
    /// recently used idle handle when at capacity) if needed. A read-only handle registered
    /// for `path` is upgraded in place.
    pub fn get_handle(&self, path: &Path) -> Result<Arc<AsyncFileHandle>, HandleError> {
        self.acquire(path, true)
    }

    /// Like [`HandlePool::get_handle`] for reading: a missing file is an error, never
    /// created. Read-only handles are forgotten once the pool closes them.
    pub fn get_read_handle(&self, path: &Path) -> Result<Arc<AsyncFileHandle>, HandleError> {
        self.acquire(path, false)
    }

    fn acquire(&self, path: &Path, writable: bool) -> Result<Arc<AsyncFileHandle>, HandleError> {
        let mut state = self.state.lock();
        let (handle, fresh) = match state.handles.get(path) {
            Some(handle) => (Arc::clone(handle), false),
            None => {
                let handle = Arc::new(AsyncFileHandle::new(path.to_path_buf(), writable));
                state.handles.insert(path.to_path_buf(), Arc::clone(&handle));
                (handle, true)
            }
        };
        if writable && !handle.is_writable() {
            handle.make_writable()?;
        }
        if !handle.is_open() {
            if let Err(e) = self.open_locked(&mut state, &handle) {
                if fresh {
                    state.handles.remove(path);
                }
                return Err(e);
            }
        }
        handle.touch(self.tick());
        Ok(handle)
    }

    /// Reopens a handle the pool closed under pressure and returns the handle to continue
    /// with. That is `handle` itself, except for a reader whose path has been registered
    /// again since, which continues on the registered handle.
    pub fn reopen(&self, handle: &Arc<AsyncFileHandle>) -> Result<Arc<AsyncFileHandle>, HandleError> {
        let mut state = self.state.lock();
        let registered = Arc::clone(
            state
                .handles
                .entry(handle.path().to_path_buf())
                .or_insert_with(|| Arc::clone(handle)),
        );
        if !Arc::ptr_eq(&registered, handle) && handle.is_writable() {
            // Finalized and registered again since; the old cursor is meaningless.
            warn!("Refusing to reopen stale handle for {:?}", handle.path());
            return Err(HandleError::Closed(handle.path().to_path_buf()));
        }
        if !registered.is_open() {
            self.open_locked(&mut state, &registered)?;
        }
        registered.touch(self.tick());
        Ok(registered)
    }

    fn open_locked(&self, state: &mut PoolState, handle: &Arc<AsyncFileHandle>) -> Result<(), HandleError> {
        if state.open >= self.max_open {
            self.evict_locked(state)?;
        }
        handle.open()?;
        state.open += 1;
        debug!("Opened {:?} ({} of {} handles open)", handle.path(), state.open, self.max_open);
        Ok(())
    }

    fn evict_locked(&self, state: &mut PoolState) -> Result<(), HandleError> {
        let victim = state
            .handles
            .values()
            .filter(|handle| handle.is_open() && handle.in_flight() == 0)
            .min_by_key(|handle| handle.last_access())
            .cloned()
            .ok_or(HandleError::Exhausted { max: self.max_open })?;

        if victim.close() {
            state.open -= 1;
            debug!("Closed least recently used handle {:?}", victim.path());
        }
        if !victim.is_writable() {
            state.handles.remove(victim.path());
        }
        Ok(())
    }

    /// Syncs and closes the handle for `path` and forgets its cursor.
    pub fn finalize(&self, path: &Path) -> Result<(), HandleError> {
        let mut state = self.state.lock();
        let Some(handle) = state.handles.remove(path) else {
            return Ok(());
        };
        let synced = handle.sync();
        if handle.close() {
            state.open -= 1;
        }
        synced?;
        debug!("Finalized {:?}", path);
        Ok(())
    }
}
