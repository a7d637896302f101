//! # Event Tap
//!
//! Read-only fan-out of what the relay is doing, for dashboards and tests.
//! Every subscriber gets its own clone of each event through a
//! `tokio::sync::broadcast` channel; nothing flows back into the engine.
//!
//! A slow subscriber only lags (and loses the oldest events), it never blocks
//! ingestion or forwarding.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::relay::buffer::Queue;
use crate::relay::power::PowerMode;
use crate::relay::reading::Reading;

/// Capacity used by `EventTap::default`.
pub const DEFAULT_TAP_CAPACITY: usize = 1000;

/// Something observable happened inside the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A sensor connected to the ingestion server.
    SessionOpened { peer: SocketAddr },
    /// A sensor session ended, with the reason.
    SessionClosed { peer: SocketAddr, reason: String },
    /// A reading was classified and appended to `pending`.
    Ingested(Reading),
    /// A reading was discarded because the power level is zero.
    Dropped { sensor_id: String },
    /// `count` readings moved from `pending` to `held` in constrained mode.
    Held { count: usize },
    /// `count` readings from `queue` were delivered downstream.
    Forwarded { queue: Queue, count: usize },
    /// A forward attempt failed after `sent` readings went out.
    ForwardFailed {
        queue: Queue,
        sent: usize,
        error: String,
    },
    /// The power level changed; `mode` is the mode after the change.
    PowerChanged { level: f64, mode: PowerMode },
}

/// Cloneable publisher handle; subscribe to observe the relay.
#[derive(Debug, Clone)]
pub struct EventTap {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventTap {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Having no subscriber is normal.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    /// Starts observing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventTap {
    fn default() -> Self {
        Self::new(DEFAULT_TAP_CAPACITY)
    }
}
