//! Tracing initialization.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `SHOAL_LOG` overrides the verbosity flag.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("SHOAL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
