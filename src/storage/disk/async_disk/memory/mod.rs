pub mod memory_pool;
