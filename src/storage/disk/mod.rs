pub mod async_disk;
