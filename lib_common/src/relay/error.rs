//! Error taxonomy of the relay engine.
//!
//! None of these errors is fatal to the process. Connection and decode errors
//! end the affected session or forward attempt, and resource exhaustion only
//! drops the reading that arrived while the power level was at zero.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::relay::reading::ReadingError;

/// Failures while turning a byte stream into readings and back.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid reading: {0}")]
    Invalid(#[from] ReadingError),

    #[error("frame exceeds {max} bytes without a newline delimiter")]
    TooLong { max: usize },
}

/// Top level error of the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("decode error: {0}")]
    Decode(#[from] FrameError),

    #[error("power depleted, reading from {sensor_id} discarded")]
    ResourceExhausted { sensor_id: String },

    #[error("forward to {addr} timed out after {millis} ms")]
    Timeout { addr: String, millis: u64 },

    #[error("invalid relay settings, {field} {reason}")]
    InvalidSettings { field: &'static str, reason: String },

    #[error("failed to bind ingestion listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Wraps an I/O failure talking to `addr`.
    pub fn connection(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            addr: addr.into(),
            source,
        }
    }
}
