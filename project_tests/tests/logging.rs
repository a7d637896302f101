use std::fs;

use lib_common::loggers::{prune_logs, setup_logging};
use tempfile::tempdir;

// One test per binary: the global subscriber can only be installed once.
#[test]
fn setup_logging_writes_json_lines_to_a_daily_file() {
    let temp_dir = tempdir().expect("Failed to create temporary directory");
    let log_dir = temp_dir.path().join("logs");

    let guard = setup_logging("relay_test", &log_dir, "info").expect("Failed to set up logging");
    tracing::warn!(sensor_id = "s1", "This is a warning message");
    drop(guard);

    let log_files: Vec<_> = fs::read_dir(&log_dir)
        .expect("Failed to read log directory")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    assert_eq!(log_files.len(), 1, "expected exactly one log file");
    let name = log_files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("relay_test."), "unexpected log file {name}");

    let contents = fs::read_to_string(&log_files[0]).expect("Failed to read log file");
    if std::env::var("RUST_LOG").is_err() {
        let line = contents
            .lines()
            .find(|line| line.contains("This is a warning message"))
            .expect("warning not found in log file");
        let json: serde_json::Value = serde_json::from_str(line).expect("log line is JSON");
        assert_eq!(json["fields"]["sensor_id"], "s1");
        assert_eq!(json["level"], "WARN");
    }

    // a second file for the same app makes the older one prunable
    fs::write(log_dir.join("relay_test.1999-01-01"), b"").unwrap();
    assert_eq!(prune_logs(&log_dir, "relay_test", 1).unwrap(), 1);
    assert!(log_files[0].exists());
}
