use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::config::{ContainerId, RecordId};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer pool exhausted: all {max} buffers are leased")]
    Exhausted { max: usize },
}

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("No file handle slot available: {max} handles open and none idle")]
    Exhausted { max: usize },
    #[error("Handle for {0:?} was closed")]
    Closed(PathBuf),
    #[error("File handle I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexingError {
    #[error("Record id 0 is reserved and cannot be indexed")]
    InvalidId,
    #[error("Record {0} is already indexed")]
    AlreadyIndexed(RecordId),
    #[error("Index node was pruned concurrently")]
    Retired,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Malformed record: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Indexing(#[from] IndexingError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("{failed} of {expected} I/O operations failed")]
    Incomplete { expected: usize, failed: usize },
    #[error("I/O task did not complete: {0}")]
    TaskAborted(String),
    #[error("Read of {requested} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { requested: usize, capacity: usize },
    #[error("Unknown persistence job {0}")]
    UnknownJob(ContainerId),
    #[error("Persistence job {0} already exists")]
    JobExists(ContainerId),
    #[error("Persistence job {0} is closed")]
    JobClosed(ContainerId),
    #[error("Corrupt index container: {0}")]
    CorruptIndex(String),
}

impl StorageError {
    /// Conditions the I/O layer recovers from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Handle(HandleError::Closed(_)))
            || matches!(self, StorageError::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}
