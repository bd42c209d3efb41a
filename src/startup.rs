//! Contains a collection of functions that are called at the start of the program.

use std::panic;

use log::LevelFilter;

pub fn setup_logger(log_level: &str) {
    let mut log_builder = env_logger::Builder::new();

    log_builder
        // Timestamp in millis
        .format_timestamp_millis()
        // Parse user defined log level configuration
        .parse_filters(log_level)
        // Network internals are very chatty during retries; errors only
        .filter_module("hyper", LevelFilter::Error)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("rustls", LevelFilter::Warn);

    log_builder.init();
}

pub fn setup_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string payload>");
        match panic_info.location() {
            Some(location) => log::error!("panic at {location}: {message}"),
            None => log::error!("panic: {message}"),
        }
    }));
}
