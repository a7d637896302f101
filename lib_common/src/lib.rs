//! Shared library of the drone telemetry relay.
//!
//! Each top-level module sits behind a cargo feature of the same name so the
//! binaries only compile what they use; `full` enables everything.

#[cfg(feature = "relay")]
pub mod relay;

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "loggers")]
pub mod loggers;
