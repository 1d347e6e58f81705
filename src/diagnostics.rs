//! Logging initialization for host binaries/tests embedding this crate.
//!
//! The crate itself only ever calls `log::{debug,warn,error}!` and never
//! installs a logger (a library installing a global logger for its host is
//! a bug, not a feature); `init_logging` is an opt-in convenience for a host
//! that has no logging setup of its own yet, built on `colog` the same way
//! a binary entry point would initialize its own logger.

/// Installs a `colog` logger filtering to `Warn` by default, `Debug` for
/// this crate's own target, unless `RUST_LOG` is set, in which case that
/// takes over completely.
///
/// Calling this more than once per process panics (the underlying
/// `log::set_logger` does too); hosts that already initialize their own
/// logger should not call this at all.
pub fn init_logging() {
    let mut builder = colog::basic_builder();
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else {
        builder.filter(None, log::LevelFilter::Warn);
        builder.filter(Some(env!("CARGO_PKG_NAME")), log::LevelFilter::Debug);
    }
    builder.init();
}

/// Installs a panic hook that logs the panic through `log::error!` instead
/// of only writing to stderr, so hosts that redirect logging elsewhere
/// still see decode-worker/plugin-hook panics surfaced by
/// `std::panic::catch_unwind` (`plugin::guarded`) reach the same sink.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{thread_name}': {panic_info}");
    }));
}
