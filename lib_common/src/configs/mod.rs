//! # Configuration Modules
//!
//! Layered configuration of the relay process: built-in defaults, then the
//! JSON configuration file, then environment variables and CLI flags.

/// Provides the relay process configuration and its validation.
pub mod relay_config;

pub use relay_config::{load_config, load_config_with, ConfigError, RelayConfig};
