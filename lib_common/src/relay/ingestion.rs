//! # Ingestion Server
//!
//! Accepts sensor connections and runs one independent session task per
//! connection. Each session decodes frames with the `ReadingCodec` and hands
//! every reading to the shared `Ingestor`, which classifies it and appends it
//! to `pending`.
//!
//! A session ends on a clean disconnect, an I/O error or the first malformed
//! frame; other sessions and the accept loop are never affected. Accept errors
//! are logged and the loop keeps going.
//!
//! While the power level is exactly zero every decoded reading is discarded
//! before classification. The session stays open so sensors resume as soon as
//! the level rises again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::buffer::RelayBuffer;
use crate::relay::classifier;
use crate::relay::error::{FrameError, RelayError};
use crate::relay::framer::ReadingCodec;
use crate::relay::power::PowerMonitor;
use crate::relay::reading::Reading;
use crate::relay::tap::{EventTap, RelayEvent};

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Admission step shared by all sessions.
#[derive(Debug)]
pub struct Ingestor {
    buffer: Arc<RelayBuffer>,
    power: Arc<PowerMonitor>,
    tap: EventTap,
    dropped: AtomicU64,
}

impl Ingestor {
    pub fn new(buffer: Arc<RelayBuffer>, power: Arc<PowerMonitor>, tap: EventTap) -> Self {
        Self {
            buffer,
            power,
            tap,
            dropped: AtomicU64::new(0),
        }
    }

    /// Classifies `reading` and queues it for forwarding, unless the battery
    /// is depleted, in which case it is dropped untouched.
    pub fn admit(&self, reading: Reading) -> Result<(), RelayError> {
        if self.power.is_depleted() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.tap.publish(RelayEvent::Dropped {
                sensor_id: reading.sensor_id.clone(),
            });
            return Err(RelayError::ResourceExhausted {
                sensor_id: reading.sensor_id,
            });
        }

        let tagged = classifier::tag(reading);
        if tagged.anomalies.is_empty() {
            debug!(sensor_id = %tagged.sensor_id, temperature = tagged.temperature, humidity = tagged.humidity, "reading received");
        } else {
            warn!(sensor_id = %tagged.sensor_id, anomalies = ?tagged.anomalies, "anomalous reading received");
        }
        self.buffer.push_pending(tagged.clone());
        self.tap.publish(RelayEvent::Ingested(tagged));
        Ok(())
    }

    /// Readings discarded because of depletion since start-up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct IngestionServer {
    listener: TcpListener,
    ingestor: Arc<Ingestor>,
    tap: EventTap,
    max_frame_bytes: usize,
}

impl IngestionServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        ingestor: Arc<Ingestor>,
        tap: EventTap,
        max_frame_bytes: usize,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(Self {
            listener,
            ingestor,
            tap,
            max_frame_bytes,
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until `cancel` fires; sessions are cancelled with it.
    pub async fn run(self, cancel: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "listening for sensors"),
            Err(e) => warn!(error = %e, "listening for sensors on unknown address"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingestion server stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session {
                            peer,
                            ingestor: Arc::clone(&self.ingestor),
                            tap: self.tap.clone(),
                            max_frame_bytes: self.max_frame_bytes,
                        };
                        tokio::spawn(session.run(stream, cancel.child_token()));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept sensor connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

/// One connected sensor.
struct Session {
    peer: SocketAddr,
    ingestor: Arc<Ingestor>,
    tap: EventTap,
    max_frame_bytes: usize,
}

impl Session {
    async fn run(self, stream: TcpStream, cancel: CancellationToken) {
        let peer = self.peer;
        info!(%peer, "sensor connected");
        self.tap.publish(RelayEvent::SessionOpened { peer });

        let mut frames = FramedRead::new(stream, ReadingCodec::new(self.max_frame_bytes));
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "relay shutting down".to_string(),
                frame = frames.next() => match frame {
                    None => break "peer disconnected".to_string(),
                    Some(Ok(reading)) => {
                        if let Err(e) = self.ingestor.admit(reading) {
                            debug!(%peer, error = %e, "reading not admitted");
                        }
                    }
                    Some(Err(FrameError::Io(e))) => {
                        warn!(%peer, error = %e, "connection error");
                        break format!("connection error: {e}");
                    }
                    Some(Err(e)) => {
                        warn!(%peer, error = %e, "decode error, closing session");
                        break format!("decode error: {e}");
                    }
                }
            }
        };

        info!(%peer, %reason, "sensor session closed");
        self.tap.publish(RelayEvent::SessionClosed { peer, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::buffer::Queue;
    use crate::relay::power::PowerSettings;

    fn ingestor_at(level: f64) -> (Ingestor, Arc<RelayBuffer>, Arc<PowerMonitor>) {
        let tap = EventTap::default();
        let buffer = Arc::new(RelayBuffer::new());
        let (power, _recovery) = PowerMonitor::new(
            PowerSettings {
                initial_level: level,
                drain_step: 1.0,
                ..PowerSettings::default()
            },
            tap.clone(),
        );
        let power = Arc::new(power);
        (
            Ingestor::new(Arc::clone(&buffer), Arc::clone(&power), tap),
            buffer,
            power,
        )
    }

    #[test]
    fn admitted_reading_is_tagged_and_pending() {
        let (ingestor, buffer, _power) = ingestor_at(100.0);
        ingestor
            .admit(Reading::new("s1", 100.0, 85.0, "2024-05-01T12:00:00Z"))
            .unwrap();

        let pending = buffer.snapshot(Queue::Pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].anomalies, ["temperature_out_of_range:100"]);
    }

    #[test]
    fn depleted_power_drops_reading() {
        let (ingestor, buffer, power) = ingestor_at(1.0);
        power.tick();
        assert!(power.is_depleted());

        let result = ingestor.admit(Reading::new("s1", 100.0, 50.0, "2024-05-01T12:00:00Z"));

        assert!(matches!(result, Err(RelayError::ResourceExhausted { .. })));
        assert_eq!(buffer.counts().pending + buffer.counts().held, 0);
        assert_eq!(ingestor.dropped(), 1);
    }

    #[test]
    fn constrained_but_not_depleted_still_buffers() {
        let (ingestor, buffer, _power) = ingestor_at(5.0);
        ingestor
            .admit(Reading::new("s1", 20.0, 50.0, "2024-05-01T12:00:00Z"))
            .unwrap();
        assert_eq!(buffer.len(Queue::Pending), 1);
    }
}
