//! # Storage I/O Primitives
//!
//! - **`file_handle`**: `AsyncFileHandle`, an open file plus its atomic append cursor.
//! - **`file_ops`**: the positional read/write seam requests execute through.
//! - **`request`**: one constituent request and its partial-transfer state machine.
//! - **`coordinator`**: fire-once completion tracking across N requests.

pub mod coordinator;
pub mod file_handle;
pub mod file_ops;
pub mod request;
