//! Structured logging bootstrap
//!
//! Console logging through `tracing` with an environment filter.
//! Initialization is idempotent so library consumers and tests can call
//! it freely.

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Console logging level
    pub level: Level,
    /// Include span timing events
    pub with_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            with_targets: false,
        }
    }
}

static LOGGING_INITIALIZED: Once = Once::new();

/// Initialize the logging system
pub fn initialize_logging(config: LoggingConfig) {
    LOGGING_INITIALIZED.call_once(|| {
        let env_filter = EnvFilter::builder()
            .with_default_directive(config.level.into())
            .from_env_lossy();

        let _ = fmt()
            .with_env_filter(env_filter)
            .with_target(config.with_targets)
            .try_init();
    });
}

/// Initialize logging with default configuration
pub fn initialize_default_logging() {
    initialize_logging(LoggingConfig::default());
}
