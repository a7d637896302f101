//! # Forwarder
//!
//! Periodic task draining the relay buffer to the central endpoint.
//!
//! ## Each tick
//! - **Constrained**: everything in `pending` moves to `held`. No network
//!   activity.
//! - **Normal**: a leftover `held` backlog is delivered first (it is older than
//!   anything in `pending`); if that succeeds, `pending` is delivered.
//!
//! A recovery signal from the power monitor triggers an immediate `held` flush
//! outside the regular schedule, unless the mode is already constrained again
//! by the time the signal is consumed.
//!
//! ## Delivery
//! Every attempt opens a fresh connection, sends the snapshot one frame at a
//! time and closes the connection. With `AckPolicy::Batch` the snapshot is only
//! removed from the buffer once the whole batch went out, so a failure midway
//! resends the already delivered prefix next time (at-least-once, duplicates
//! possible downstream). `AckPolicy::PerItem` removes each reading as soon as
//! its frame is written, which avoids those duplicates.
//!
//! A connect failure, write failure or timeout leaves the unsent readings in
//! place; the next tick retries.

use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::buffer::{Queue, RelayBuffer};
use crate::relay::error::{FrameError, RelayError};
use crate::relay::framer::ReadingCodec;
use crate::relay::power::{PowerMode, PowerMonitor, RecoveryReceiver};
use crate::relay::reading::Reading;
use crate::relay::tap::{EventTap, RelayEvent};

/// When delivered readings are removed from the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Clear the batch only after all of it was sent.
    #[default]
    Batch,
    /// Clear each reading as soon as it was sent.
    PerItem,
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckPolicy::Batch => f.write_str("batch"),
            AckPolicy::PerItem => f.write_str("per-item"),
        }
    }
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(AckPolicy::Batch),
            "per-item" | "per_item" | "peritem" => Ok(AckPolicy::PerItem),
            other => Err(format!("unknown ack policy {other:?}, expected batch or per-item")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwarderSettings {
    /// Period between ticks.
    pub interval: Duration,
    /// Upper bound for one delivery attempt, connect included.
    pub timeout: Duration,
    pub ack_policy: AckPolicy,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            ack_policy: AckPolicy::Batch,
        }
    }
}

/// Opens connections to the downstream endpoint.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human readable target, used in logs and errors.
    fn target(&self) -> String;
}

/// Plain TCP connection to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move { TcpStream::connect(addr).await }
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}

pub struct Forwarder<C: Connector> {
    connector: C,
    buffer: Arc<RelayBuffer>,
    power: Arc<PowerMonitor>,
    tap: EventTap,
    settings: ForwarderSettings,
}

impl<C: Connector> Forwarder<C> {
    pub fn new(
        connector: C,
        buffer: Arc<RelayBuffer>,
        power: Arc<PowerMonitor>,
        tap: EventTap,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            connector,
            buffer,
            power,
            tap,
            settings,
        }
    }

    /// Runs the periodic loop until `cancel` fires. The first tick is immediate.
    pub async fn run(self, mut recovery: RecoveryReceiver, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target = %self.connector.target(),
            interval = ?self.settings.interval,
            ack_policy = %self.settings.ack_policy,
            "forwarder started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("forwarder stopping");
                    break;
                }
                Some(signal) = recovery.recv() => {
                    if self.power.mode() == PowerMode::Normal {
                        info!(level = signal.level, held = self.buffer.len(Queue::Held), "recovery signal received, flushing held readings");
                        let _ = self.deliver(Queue::Held).await;
                    } else {
                        // power dropped again before the signal was consumed
                        debug!(level = signal.level, "stale recovery signal ignored, still constrained");
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduled pass.
    pub async fn tick(&self) {
        match self.power.mode() {
            PowerMode::Constrained => {
                let moved = self.buffer.hold_pending();
                if moved > 0 {
                    info!(
                        moved,
                        held = self.buffer.len(Queue::Held),
                        "constrained mode, holding pending readings"
                    );
                    self.tap.publish(RelayEvent::Held { count: moved });
                }
            }
            PowerMode::Normal => {
                if !self.buffer.is_empty(Queue::Held) && self.deliver(Queue::Held).await.is_err() {
                    return;
                }
                let _ = self.deliver(Queue::Pending).await;
            }
        }
    }

    /// Sends the current contents of `queue` downstream. Returns how many
    /// readings were delivered and removed.
    pub async fn deliver(&self, queue: Queue) -> Result<usize, RelayError> {
        let batch = self.buffer.snapshot(queue);
        if batch.is_empty() {
            return Ok(0);
        }

        let target = self.connector.target();
        let mut sent = 0;
        let attempt = timeout(
            self.settings.timeout,
            self.send_batch(queue, &batch, &target, &mut sent),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RelayError::Timeout {
                addr: target.clone(),
                millis: self.settings.timeout.as_millis() as u64,
            })
        });

        match attempt {
            Ok(()) => {
                if self.settings.ack_policy == AckPolicy::Batch {
                    self.buffer.commit(queue, batch.len());
                }
                info!(%queue, count = batch.len(), %target, "forwarded readings to central endpoint");
                self.tap.publish(RelayEvent::Forwarded {
                    queue,
                    count: batch.len(),
                });
                Ok(batch.len())
            }
            Err(e) => {
                warn!(
                    %queue,
                    sent,
                    remaining = self.buffer.len(queue),
                    error = %e,
                    "forward attempt failed, retrying next tick"
                );
                self.tap.publish(RelayEvent::ForwardFailed {
                    queue,
                    sent,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn send_batch(
        &self,
        queue: Queue,
        batch: &[Reading],
        target: &str,
        sent: &mut usize,
    ) -> Result<(), RelayError> {
        let stream = self
            .connector
            .connect()
            .await
            .map_err(|e| RelayError::connection(target, e))?;
        let mut frames = FramedWrite::new(stream, ReadingCodec::default());

        for reading in batch {
            frames
                .send(reading)
                .await
                .map_err(|e| send_error(target, e))?;
            *sent += 1;
            if self.settings.ack_policy == AckPolicy::PerItem {
                self.buffer.commit(queue, 1);
            }
        }

        let mut stream = frames.into_inner();
        if let Err(e) = stream.shutdown().await {
            debug!(%target, error = %e, "closing forward connection failed");
        }
        Ok(())
    }
}

fn send_error(target: &str, error: FrameError) -> RelayError {
    match error {
        FrameError::Io(source) => RelayError::connection(target, source),
        other => RelayError::Decode(other),
    }
}
