//! Buffer, eviction and asynchronous storage engine for a monitoring server's data plane.

pub mod buffer;
pub mod common;
pub mod query;
pub mod storage;
pub mod types_db;
