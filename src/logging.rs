//! Log subscriber setup for hosts that don't bring their own
//!
//! The engine only emits through `tracing` macros; this is a convenience
//! for host programs (and tests) that want those events on the console.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize console logging with an env-driven filter.
///
/// Respects `RUST_LOG`; defaults to info globally and debug for this
/// crate. Safe to call when a subscriber is already set: the error is
/// ignored and the existing subscriber wins.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,traceline=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
