use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

pub fn initialize_logger() {
    // Use call_once_force to recover if an earlier initialization attempt panicked.
    INIT.call_once_force(|_| {
        let mut builder = Builder::new();

        builder
            .filter_level(LevelFilter::Info)
            .filter_module("perfstore", LevelFilter::Info)
            .filter_module("perfstore::buffer", LevelFilter::Info)
            .filter_module("perfstore::storage", LevelFilter::Info)
            .filter_module("perfstore::query", LevelFilter::Info)
            .format_timestamp_millis()
            .parse_default_env();

        // Another logger may already be installed by the embedding process.
        let _ = builder.try_init();
    });
}
