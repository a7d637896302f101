//! # Relay Engine Module
//!
//! The drone side of the telemetry pipeline:
//!
//! ```text
//! sensor --(tcp, json lines)--> ingestion --> classifier --> buffer --> forwarder --(tcp, json lines)--> central
//! ```
//!
//! ## Components:
//!
//! - **`reading`**: the `Reading` record and its validation.
//! - **`framer`**: newline-delimited JSON codec shared by both legs.
//! - **`classifier`**: pure temperature / humidity anomaly rules.
//! - **`power`**: simulated battery with hysteresis between `NORMAL` and
//!   `CONSTRAINED`, plus the recovery hook.
//! - **`buffer`**: the shared `pending` / `held` queues.
//! - **`ingestion`**: the accept loop and per-sensor sessions.
//! - **`forwarder`**: periodic, retrying delivery to the central endpoint.
//! - **`tap`**: read-only event stream for dashboards.
//! - **`engine`**: assembles everything and owns the task lifecycle.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod buffer;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod framer;
pub mod ingestion;
pub mod power;
pub mod reading;
pub mod tap;

// --- Public API Re-exports ---
pub use buffer::{BufferCounts, Queue, RelayBuffer};
pub use classifier::{classify, tag, Anomaly};
pub use engine::{RelayEngine, RelayHandle, RelaySettings, RelayStatus, RunningRelay};
pub use error::{FrameError, RelayError};
pub use forwarder::{AckPolicy, Connector, Forwarder, ForwarderSettings, TcpConnector};
pub use framer::{ReadingCodec, DEFAULT_MAX_FRAME_BYTES};
pub use ingestion::{IngestionServer, Ingestor};
pub use power::{PowerMode, PowerMonitor, PowerSettings, PowerState, PowerTransition, Recovered};
pub use reading::{Reading, ReadingError};
pub use tap::{EventTap, RelayEvent};
