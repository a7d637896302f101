//! # Relay Engine
//!
//! Wires the shared state (`RelayBuffer`, `PowerMonitor`, `EventTap`) into
//! the three long running tasks of the relay:
//!
//! 1. the ingestion accept loop (plus one task per sensor session),
//! 2. the power monitor tick,
//! 3. the forwarder tick.
//!
//! The tasks only meet through the synchronized buffer and power state. All of
//! them stop when the `CancellationToken` passed to `start` is cancelled.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::relay::buffer::{BufferCounts, RelayBuffer};
use crate::relay::error::RelayError;
use crate::relay::forwarder::{Connector, Forwarder, ForwarderSettings, TcpConnector};
use crate::relay::framer::DEFAULT_MAX_FRAME_BYTES;
use crate::relay::ingestion::{IngestionServer, Ingestor};
use crate::relay::power::{PowerMode, PowerMonitor, PowerSettings, RecoveryReceiver};
use crate::relay::tap::{EventTap, RelayEvent, DEFAULT_TAP_CAPACITY};

/// Process-start parameters of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Address sensors connect to.
    pub listen_addr: SocketAddr,
    /// `host:port` of the central endpoint.
    pub central_addr: String,
    pub forwarder: ForwarderSettings,
    pub power: PowerSettings,
    /// Period of the power drain tick.
    pub power_tick: Duration,
    pub max_frame_bytes: usize,
    pub tap_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000)),
            central_addr: "127.0.0.1:6000".to_string(),
            forwarder: ForwarderSettings::default(),
            power: PowerSettings::default(),
            power_tick: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            tap_capacity: DEFAULT_TAP_CAPACITY,
        }
    }
}

impl RelaySettings {
    /// Rejects values the spawned tasks cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        let periods = [
            ("forwarder.interval", self.forwarder.interval),
            ("forwarder.timeout", self.forwarder.timeout),
            ("power_tick", self.power_tick),
        ];
        for (field, period) in periods {
            if period.is_zero() {
                return Err(RelayError::InvalidSettings {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.max_frame_bytes == 0 {
            return Err(RelayError::InvalidSettings {
                field: "max_frame_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayStatus {
    pub level: f64,
    pub mode: PowerMode,
    pub pending: usize,
    pub held: usize,
    pub dropped: u64,
}

/// Cloneable read-only access to a (possibly running) engine.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    buffer: Arc<RelayBuffer>,
    power: Arc<PowerMonitor>,
    ingestor: Arc<Ingestor>,
    tap: EventTap,
}

impl RelayHandle {
    pub fn status(&self) -> RelayStatus {
        let power = self.power.state();
        let BufferCounts { pending, held } = self.buffer.counts();
        RelayStatus {
            level: power.level,
            mode: power.mode,
            pending,
            held,
            dropped: self.ingestor.dropped(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tap.subscribe()
    }

    /// The power monitor, e.g. to feed it an external charging signal.
    pub fn power(&self) -> &Arc<PowerMonitor> {
        &self.power
    }
}

pub struct RelayEngine {
    settings: RelaySettings,
    handle: RelayHandle,
    recovery: RecoveryReceiver,
}

impl RelayEngine {
    pub fn new(settings: RelaySettings) -> Self {
        let tap = EventTap::new(settings.tap_capacity);
        let buffer = Arc::new(RelayBuffer::new());
        let (power, recovery) = PowerMonitor::new(settings.power, tap.clone());
        let power = Arc::new(power);
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&buffer),
            Arc::clone(&power),
            tap.clone(),
        ));
        Self {
            settings,
            handle: RelayHandle {
                buffer,
                power,
                ingestor,
                tap,
            },
            recovery,
        }
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> RelayStatus {
        self.handle.status()
    }

    /// Binds the listener and spawns all tasks, forwarding over TCP.
    pub async fn start(self, cancel: CancellationToken) -> Result<RunningRelay, RelayError> {
        let connector = TcpConnector::new(self.settings.central_addr.clone());
        self.start_with_connector(connector, cancel).await
    }

    /// Same as `start` with a custom downstream connector.
    pub async fn start_with_connector<C: Connector>(
        self,
        connector: C,
        cancel: CancellationToken,
    ) -> Result<RunningRelay, RelayError> {
        let RelayEngine {
            settings,
            handle,
            recovery,
        } = self;
        settings.validate()?;

        let server = IngestionServer::bind(
            settings.listen_addr,
            Arc::clone(&handle.ingestor),
            handle.tap.clone(),
            settings.max_frame_bytes,
        )
        .await?;
        let local_addr = server
            .local_addr()
            .map_err(|source| RelayError::Bind {
                addr: settings.listen_addr,
                source,
            })?;

        let forwarder = Forwarder::new(
            connector,
            Arc::clone(&handle.buffer),
            Arc::clone(&handle.power),
            handle.tap.clone(),
            settings.forwarder,
        );

        let tasks = vec![
            tokio::spawn(server.run(cancel.clone())),
            tokio::spawn(
                Arc::clone(&handle.power).run(settings.power_tick, cancel.clone()),
            ),
            tokio::spawn(forwarder.run(recovery, cancel.clone())),
        ];
        info!(%local_addr, central = %settings.central_addr, "relay engine started");

        Ok(RunningRelay {
            local_addr,
            handle,
            tasks,
        })
    }
}

/// The spawned engine.
pub struct RunningRelay {
    local_addr: SocketAddr,
    handle: RelayHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningRelay {
    /// Address sensors can connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Waits for every engine task to finish.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "relay task ended abnormally");
            }
        }
        info!("relay engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_fresh_engine() {
        let engine = RelayEngine::new(RelaySettings::default());
        let status = engine.status();
        assert_eq!(
            status,
            RelayStatus {
                level: 100.0,
                mode: PowerMode::Normal,
                pending: 0,
                held: 0,
                dropped: 0,
            }
        );
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_stops_on_cancel() {
        let settings = RelaySettings {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..RelaySettings::default()
        };
        let cancel = CancellationToken::new();
        let running = RelayEngine::new(settings).start(cancel.clone()).await.unwrap();
        assert_ne!(running.local_addr().port(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .expect("engine tasks stop after cancel");
    }

    #[tokio::test]
    async fn zero_periods_are_rejected_before_anything_is_spawned() {
        let base = RelaySettings {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..RelaySettings::default()
        };
        let zero_interval = RelaySettings {
            forwarder: ForwarderSettings {
                interval: Duration::ZERO,
                ..ForwarderSettings::default()
            },
            ..base.clone()
        };
        let zero_tick = RelaySettings {
            power_tick: Duration::ZERO,
            ..base
        };

        for (settings, expected) in [(zero_interval, "forwarder.interval"), (zero_tick, "power_tick")] {
            let result = RelayEngine::new(settings).start(CancellationToken::new()).await;
            match result {
                Err(RelayError::InvalidSettings { field, .. }) => assert_eq!(field, expected),
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => panic!("engine started with a zero {expected}"),
            }
        }
    }
}
