//! Logging setup
//!
//! Process-wide bootstrap, kept out of the model code. Call once at startup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter, e.g. `BRESNET_LOG=debug`
pub const LOG_ENV_VAR: &str = "BRESNET_LOG";

/// Install a fmt subscriber filtered by `BRESNET_LOG`, falling back to `level`
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .try_init()
        .is_ok()
}
