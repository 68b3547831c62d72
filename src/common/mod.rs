pub mod config;
pub mod exception;
pub mod logger;
pub mod monitor_instance;
pub mod object_sizes;
