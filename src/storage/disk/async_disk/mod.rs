//! Asynchronous Storage I/O
//!
//! Resilient, partially-retried file I/O for persistence containers.
//!
//! # Submodules
//!
//! - [`memory`]: the bounded pool of reusable I/O buffers.
//! - [`cache`]: the LRU-bounded pool of open file handles.
//! - [`io`]: file handles, the positional I/O seam, request state machine and the
//!   multi-part completion coordinator.
//! - [`storage_writer`] / [`storage_reader`]: entry points issuing coordinated writes and
//!   reads through the handle pool.
//!
//! Requests are driven by tasks on the tokio runtime; each attempt runs on the blocking
//! pool, so the issuing thread returns as soon as the request is submitted.

pub mod cache;
pub mod io;
pub mod memory;
pub mod storage_reader;
pub mod storage_writer;

pub use cache::handle_pool::HandlePool;
pub use io::coordinator::{IoCoordinator, IoOutcome, PartOutcome};
pub use io::file_handle::AsyncFileHandle;
pub use io::file_ops::{FileOps, PositionalFileOps};
pub use memory::memory_pool::{BufferPool, PoolStats, PooledBuffer};
pub use storage_reader::StorageReader;
pub use storage_writer::StorageWriter;
