//! Logging utilities and structured logging support

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    let _ = env_logger::try_init();
}

/// Initialize the logging system with an explicit filter
///
/// `filter` uses the `RUST_LOG` syntax (for example `"info"` or
/// `"rendering_device=debug,warn"`). An already-installed logger is left in place.
pub fn init_with_level(filter: &str) {
    let _ = env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .try_init();
}
