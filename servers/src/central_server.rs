//! # Central Server
//!
//! Sink for the readings a drone relay forwards. Accepts any number of
//! concurrent connections, decodes newline-delimited JSON readings with the
//! relay's own codec and logs each one together with its anomaly labels.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::codec::FramedRead;
use tracing::{error, info, warn};

use lib_common::loggers::setup_logging;
use lib_common::relay::ReadingCodec;

const APP_NAME: &str = "central_server";

#[derive(Parser, Debug, Clone)]
#[command(about = "Central endpoint receiving forwarded drone telemetry", version)]
struct Args {
    #[arg(long, env = "CENTRAL_HOST", default_value = "0.0.0.0", help = "Address to listen on.")]
    host: String,

    #[arg(long, env = "CENTRAL_PORT", default_value_t = 6000, help = "Port to listen on.")]
    port: u16,

    #[arg(long, env = "CENTRAL_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    log_dir: PathBuf,

    #[arg(long, env = "CENTRAL_LOG_LEVEL", default_value = "info", help = "Logging level.")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let _log_guard = setup_logging(APP_NAME, &args.log_dir, &args.log_level)
        .context("failed to initialize logging")?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "central server listening");

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| accept_loop(guard, listener));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!(
            "shutdown: gracefully {}s after shutdown signal received",
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }
    Ok(())
}

async fn accept_loop(guard: ShutdownGuard, listener: TcpListener) {
    let received = Arc::new(AtomicU64::new(0));
    loop {
        tokio::select! {
            _ = guard.cancelled() => {
                info!(received = received.load(Ordering::Relaxed), "Signal received: initiate graceful shutdown");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let received = Arc::clone(&received);
                    guard.spawn_task_fn(move |guard| handle_relay(guard, stream, peer, received));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Logs every reading sent over one relay connection.
async fn handle_relay(
    guard: ShutdownGuard,
    stream: TcpStream,
    peer: SocketAddr,
    received: Arc<AtomicU64>,
) {
    info!(%peer, "relay connected");
    let mut frames = FramedRead::new(stream, ReadingCodec::default());
    loop {
        tokio::select! {
            _ = guard.cancelled() => break,
            frame = frames.next() => match frame {
                None => break,
                Some(Ok(reading)) => {
                    let total = received.fetch_add(1, Ordering::Relaxed) + 1;
                    if reading.anomalies.is_empty() {
                        info!(
                            %peer,
                            sensor_id = %reading.sensor_id,
                            temperature = reading.temperature,
                            humidity = reading.humidity,
                            timestamp = %reading.timestamp,
                            total,
                            "reading received"
                        );
                    } else {
                        warn!(
                            %peer,
                            sensor_id = %reading.sensor_id,
                            temperature = reading.temperature,
                            humidity = reading.humidity,
                            timestamp = %reading.timestamp,
                            anomalies = ?reading.anomalies,
                            total,
                            "anomalous reading received"
                        );
                    }
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "closing relay connection");
                    break;
                }
            }
        }
    }
    info!(%peer, "relay disconnected");
}
