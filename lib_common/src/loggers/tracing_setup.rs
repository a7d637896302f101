//! # Logging Setup
//!
//! Configures the global `tracing` subscriber:
//! - `EnvFilter` from `RUST_LOG`, falling back to the configured level.
//! - Human-readable console output with ANSI colors.
//! - JSON lines in a daily rotating file `<log_dir>/<app_name>.<date>`,
//!   written by a non-blocking background worker.
//!
//! The returned `WorkerGuard` flushes buffered file output when dropped, so
//! binaries keep it alive until `main` returns.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to prepare log directory: {0}")]
    Io(#[from] io::Error),

    #[error("invalid log level: {0}")]
    Filter(#[from] ParseError),

    #[error("failed to install global subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Installs console and file logging for `app_name`.
pub fn setup_logging(
    app_name: &str,
    log_dir: &Path,
    log_level: &str,
) -> Result<WorkerGuard, LoggerError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)?,
    };

    fs::create_dir_all(log_dir)?;
    let file_appender = rolling::daily(log_dir, app_name);
    let (file_writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(app = app_name, log_dir = %log_dir.display(), level = log_level, "logging initialized");
    Ok(guard)
}

/// Deletes all but the newest `keep` log files of `app_name` in `log_dir`.
/// Returns how many files were removed; a missing directory counts as empty.
pub fn prune_logs(log_dir: &Path, app_name: &str, keep: usize) -> io::Result<usize> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let prefix = format!("{app_name}.");
    let mut log_files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
        })
        .collect();

    // date suffixes sort chronologically; newest first
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"{}\n").unwrap();
    }

    #[test]
    fn prune_keeps_newest_files_of_the_app_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "drone_relay.2024-05-01");
        touch(dir.path(), "drone_relay.2024-05-02");
        touch(dir.path(), "drone_relay.2024-05-03");
        touch(dir.path(), "central_server.2024-05-01");

        let removed = prune_logs(dir.path(), "drone_relay", 2).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("drone_relay.2024-05-01").exists());
        assert!(dir.path().join("drone_relay.2024-05-02").exists());
        assert!(dir.path().join("drone_relay.2024-05-03").exists());
        assert!(dir.path().join("central_server.2024-05-01").exists());
    }

    #[test]
    fn prune_on_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(prune_logs(&missing, "drone_relay", 1).unwrap(), 0);
    }

    #[test]
    fn invalid_level_is_rejected_before_install() {
        let dir = tempfile::tempdir().unwrap();
        // RUST_LOG takes precedence over the argument
        if std::env::var("RUST_LOG").is_err() {
            let result = setup_logging("bad_level", dir.path(), "lib_common=loudest");
            assert!(matches!(result, Err(LoggerError::Filter(_))));
        }
    }
}
