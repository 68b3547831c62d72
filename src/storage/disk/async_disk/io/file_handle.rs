use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::common::exception::HandleError;

/// Open (or re-openable) file plus the append cursor of that path.
///
/// The cursor outlives the underlying descriptor: when the handle pool closes the file
/// under pressure and reopens it later, reservations continue from where they stopped.
/// Read-only handles never create their file and carry no cursor until upgraded.
pub struct AsyncFileHandle {
    path: PathBuf,
    file: RwLock<Option<Arc<File>>>,
    writable: AtomicBool,
    write_cursor: AtomicU64,
    cursor_initialized: AtomicBool,
    last_access: AtomicU64,
    in_flight: AtomicUsize,
}

impl AsyncFileHandle {
    pub(crate) fn new(path: PathBuf, writable: bool) -> Self {
        Self {
            path,
            file: RwLock::new(None),
            writable: AtomicBool::new(writable),
            write_cursor: AtomicU64::new(0),
            cursor_initialized: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically reserves `[offset, offset + size)` and returns `offset`. Concurrent
    /// reservations never overlap.
    pub fn reserve_writing_position(&self, size: u64) -> u64 {
        self.write_cursor.fetch_add(size, Ordering::AcqRel)
    }

    pub fn writing_position(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Descriptor for one I/O attempt. The returned `Arc` keeps the file usable even if
    /// the pool closes the handle while the attempt runs.
    pub(crate) fn file(&self) -> Result<Arc<File>, HandleError> {
        self.file
            .read()
            .clone()
            .ok_or_else(|| HandleError::Closed(self.path.clone()))
    }

    /// Marks an operation as running on this handle until the lease drops. The pool does
    /// not pick handles with running operations for eviction.
    pub(crate) fn begin_io(self: &Arc<Self>) -> IoLease {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        IoLease {
            handle: Arc::clone(self),
        }
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::AcqRel);
    }

    pub(crate) fn open(&self) -> io::Result<()> {
        let mut slot = self.file.write();
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(Arc::new(self.open_file()?));
        Ok(())
    }

    /// Switches a read-only handle to read-write, replacing an open read-only descriptor.
    /// Attempts already holding the old descriptor finish on it.
    pub(crate) fn make_writable(&self) -> io::Result<()> {
        if self.writable.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut slot = self.file.write();
        if slot.is_some() {
            *slot = Some(Arc::new(self.open_file()?));
        }
        Ok(())
    }

    fn open_file(&self) -> io::Result<File> {
        if !self.is_writable() {
            return OpenOptions::new().read(true).open(&self.path);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if !self.cursor_initialized.swap(true, Ordering::AcqRel) {
            // A container that already exists is appended to, never overwritten.
            let len = file.metadata()?.len();
            self.write_cursor.fetch_max(len, Ordering::AcqRel);
        }
        Ok(file)
    }

    pub(crate) fn close(&self) -> bool {
        self.file.write().take().is_some()
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        match self.file.read().as_ref() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

pub(crate) struct IoLease {
    handle: Arc<AsyncFileHandle>,
}

impl Drop for IoLease {
    fn drop(&mut self) {
        self.handle.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
