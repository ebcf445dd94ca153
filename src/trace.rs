//! Optional tracing support.
//!
//! Built with `--features tracing`, the crate logs through the `tracing`
//! macros; without it, every log site compiles to nothing.

/// Installs a formatting subscriber suitable for tests and the demo
/// binaries. Honors `RUST_LOG`, defaulting to `tether=trace`. A no-op
/// when the `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=trace"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, warn};

// Feature off: swallow the log sites entirely.
#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {
        ()
    };
}
#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {
        ()
    };
}
#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {
        ()
    };
}
#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {debug_noop as debug, error_noop as error, info_noop as info, warn_noop as warn};
