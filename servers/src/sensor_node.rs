//! # Sensor Node
//!
//! Simulated environmental sensor. Keeps one connection to the drone relay
//! open and sends a reading every `--interval-secs`. Temperature hovers
//! around 20 °C and humidity around 50 %; with probability `--anomaly-rate`
//! a reading carries an out-of-range temperature instead.
//!
//! When the relay is unreachable or the connection breaks, the node waits
//! five seconds and reconnects.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use futures_util::SinkExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use lib_common::loggers::setup_logging;
use lib_common::relay::{Reading, ReadingCodec};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone)]
#[command(about = "Simulated temperature / humidity sensor", version)]
struct Args {
    #[arg(long, env = "SENSOR_DRONE_HOST", default_value = "127.0.0.1", help = "Host of the drone relay.")]
    drone_host: String,

    #[arg(long, env = "SENSOR_DRONE_PORT", default_value_t = 5000, help = "Port of the drone relay.")]
    drone_port: u16,

    #[arg(long, env = "SENSOR_INTERVAL_SECS", default_value_t = 2, help = "Seconds between readings.")]
    interval_secs: u64,

    #[arg(long, env = "SENSOR_ID", default_value = "sensor1", help = "Identifier sent with every reading.")]
    sensor_id: String,

    #[arg(long, env = "SENSOR_ANOMALY_RATE", default_value_t = 0.0, help = "Probability (0..=1) of an out-of-range reading.")]
    anomaly_rate: f64,

    #[arg(long, env = "SENSOR_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    log_dir: PathBuf,

    #[arg(long, env = "SENSOR_LOG_LEVEL", default_value = "info", help = "Logging level.")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let app_name = format!("sensor_node_{}", args.sensor_id);
    let _log_guard = setup_logging(&app_name, &args.log_dir, &args.log_level)
        .context("failed to initialize logging")?;

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| run(guard, args));

    match shutdown.shutdown_with_limit(Duration::from_secs(5)).await {
        Ok(elapsed) => info!(
            "shutdown: gracefully {}s after shutdown signal received",
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }
    Ok(())
}

async fn run(guard: ShutdownGuard, args: Args) {
    let target = format!("{}:{}", args.drone_host, args.drone_port);
    let interval = Duration::from_secs(args.interval_secs.max(1));
    let anomaly_rate = args.anomaly_rate.clamp(0.0, 1.0);

    loop {
        match stream_readings(&guard, &target, &args.sensor_id, interval, anomaly_rate).await {
            Ok(()) => break,
            Err(e) => warn!(%target, error = %e, "connection to relay lost, retrying in 5s"),
        }
        tokio::select! {
            _ = guard.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    info!(sensor_id = %args.sensor_id, "sensor stopped");
}

/// Sends readings over one connection. Returns `Ok` only on shutdown.
async fn stream_readings(
    guard: &ShutdownGuard,
    target: &str,
    sensor_id: &str,
    interval: Duration,
    anomaly_rate: f64,
) -> Result<()> {
    let stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    info!(%target, %sensor_id, "connected to relay");
    let mut frames = FramedWrite::new(stream, ReadingCodec::default());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = guard.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let reading = generate_reading(sensor_id, anomaly_rate);
                frames.send(&reading).await.context("failed to send reading")?;
                debug!(
                    %sensor_id,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    "reading sent"
                );
            }
        }
    }
}

fn generate_reading(sensor_id: &str, anomaly_rate: f64) -> Reading {
    let mut rng = rand::rng();
    let temperature = if rng.random_bool(anomaly_rate) {
        rng.random_range(65.0..80.0)
    } else {
        rng.random_range(17.5..22.5)
    };
    let humidity = rng.random_range(45.0..55.0);
    Reading::new(
        sensor_id,
        round2(temperature),
        round2(humidity),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
