//! Utility modules

mod logging;

pub use logging::{init_logging, LOG_ENV_VAR};
