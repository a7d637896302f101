/// Installs the `tracing` subscriber (console plus JSON rolling files) and
/// prunes old log files.
pub mod tracing_setup;

pub use tracing_setup::{prune_logs, setup_logging, LoggerError};
