//! Core infrastructure: configuration, errors, logging

pub mod config;
pub mod error;
pub mod logging;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use logging::{initialize_default_logging, initialize_logging, LoggingConfig};
