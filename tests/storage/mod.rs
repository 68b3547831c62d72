mod buffer_pool_tests;
mod persistence_tests;
mod storage_io_tests;
