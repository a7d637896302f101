//! # Drone Relay
//!
//! Runs the telemetry relay engine on the drone:
//! - accepts sensor connections and buffers their classified readings,
//! - tracks the simulated battery and holds data while power is low,
//! - forwards buffered readings to the central endpoint on a fixed period.
//!
//! Configuration comes from defaults, `drone_relay.conf`, `DRONE_*`
//! environment variables and CLI flags. A status line with the power level,
//! mode and queue sizes is logged every `status_interval_secs`.
//!
//! Ctrl-C or SIGTERM stops the engine gracefully via `tokio-graceful`.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lib_common::configs::load_config;
use lib_common::loggers::{prune_logs, setup_logging};
use lib_common::relay::{RelayEngine, RelayHandle};

const APP_NAME: &str = "drone_relay";
/// Daily log files kept on start-up.
const LOG_FILES_KEPT: usize = 7;
const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("failed to load configuration")?;
    let settings = config.resolve().context("invalid configuration")?;
    let status_interval = config.status_interval().context("invalid configuration")?;

    let log_dir = config.log_dir();
    let _log_guard = setup_logging(APP_NAME, &log_dir, config.log_level())
        .context("failed to initialize logging")?;
    match prune_logs(&log_dir, APP_NAME, LOG_FILES_KEPT) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "old log files pruned"),
        Err(e) => warn!(error = %e, "failed to prune old log files"),
    }
    info!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    let running = RelayEngine::new(settings)
        .start(cancel.clone())
        .await
        .context("failed to start relay engine")?;
    let handle = running.handle();

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| report_status(guard, handle, status_interval));
    shutdown.spawn_task_fn(move |guard: ShutdownGuard| async move {
        guard.cancelled().await;
        info!("Signal received: stopping relay engine");
        cancel.cancel();
        running.wait().await;
    });

    match shutdown.shutdown_with_limit(SHUTDOWN_LIMIT).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            warn!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}

/// Logs the relay status every `every` until shutdown.
async fn report_status(guard: ShutdownGuard, handle: RelayHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = guard.cancelled() => break,
            _ = ticker.tick() => {
                let status = handle.status();
                info!(
                    level = status.level,
                    mode = %status.mode,
                    pending = status.pending,
                    held = status.held,
                    dropped = status.dropped,
                    "relay status"
                );
            }
        }
    }
}
