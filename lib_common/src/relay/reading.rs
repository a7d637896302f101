//! # Sensor Reading
//!
//! The unit of data moved through the relay. A `Reading` is decoded from a
//! sensor frame, tagged by the classifier and then buffered until the
//! forwarder delivers it to the central endpoint.
//!
//! Readings are treated as immutable values: the classifier produces a new
//! `Reading` with its labels attached instead of editing one in place, so a
//! reading sitting in the relay buffer is never changed under a reader.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Format accepted for ISO-8601 timestamps that carry no UTC offset.
const NAIVE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Reasons a structurally valid JSON record is still rejected as a reading.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReadingError {
    #[error("sensor_id must not be empty")]
    EmptySensorId,

    #[error("timestamp {0:?} is not an ISO-8601 date-time")]
    InvalidTimestamp(String),
}

/// # Reading
///
/// One timestamped measurement from a field sensor.
///
/// The field order is the wire order. `anomalies` is only present on the wire
/// once the relay has classified the reading and found something; a clean
/// reading is forwarded without the field at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the sensor that produced the measurement.
    pub sensor_id: String,
    /// Temperature in degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Capture time as sent by the sensor, kept verbatim.
    pub timestamp: String,
    /// Anomaly labels attached by the relay, in classifier order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
}

impl Reading {
    /// Builds an unclassified reading.
    pub fn new(
        sensor_id: impl Into<String>,
        temperature: f64,
        humidity: f64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            temperature,
            humidity,
            timestamp: timestamp.into(),
            anomalies: Vec::new(),
        }
    }

    /// Returns a copy of this reading carrying `labels` in place of any
    /// labels it had before.
    pub fn with_anomalies(self, labels: Vec<String>) -> Self {
        Self {
            anomalies: labels,
            ..self
        }
    }

    /// Checks the parts of the schema serde cannot express.
    pub fn validate(&self) -> Result<(), ReadingError> {
        if self.sensor_id.trim().is_empty() {
            return Err(ReadingError::EmptySensorId);
        }
        if !is_iso8601(&self.timestamp) {
            return Err(ReadingError::InvalidTimestamp(self.timestamp.clone()));
        }
        Ok(())
    }
}

/// Accepts RFC 3339 timestamps (`2024-05-01T12:00:00Z`, `...+02:00`) and
/// offset-less ISO-8601 date-times (`2024-05-01T12:00:00.123456`).
fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, NAIVE_ISO_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_reading_serializes_without_anomalies() {
        let reading = Reading::new("s1", 25.0, 50.0, "2024-05-01T12:00:00Z");
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(
            json,
            r#"{"sensor_id":"s1","temperature":25.0,"humidity":50.0,"timestamp":"2024-05-01T12:00:00Z"}"#
        );
    }

    #[test]
    fn anomalies_are_serialized_when_present() {
        let reading = Reading::new("s1", 100.0, 50.0, "2024-05-01T12:00:00Z")
            .with_anomalies(vec!["temperature_out_of_range:100".to_string()]);
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.ends_with(r#""anomalies":["temperature_out_of_range:100"]}"#));
    }

    #[test]
    fn validate_rejects_empty_sensor_id() {
        let reading = Reading::new("  ", 20.0, 40.0, "2024-05-01T12:00:00Z");
        assert_eq!(reading.validate(), Err(ReadingError::EmptySensorId));
    }

    #[test]
    fn validate_accepts_python_style_utc_timestamps() {
        let reading = Reading::new("s1", 20.0, 40.0, "2024-05-01T12:00:00.123456Z");
        assert!(reading.validate().is_ok());
        let naive = Reading::new("s1", 20.0, 40.0, "2024-05-01T12:00:00.123456");
        assert!(naive.validate().is_ok());
    }

    #[test]
    fn validate_rejects_garbage_timestamps() {
        let reading = Reading::new("s1", 20.0, 40.0, "yesterday");
        assert!(matches!(
            reading.validate(),
            Err(ReadingError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn unknown_fields_are_ignored_on_decode() {
        let raw = r#"{"sensor_id":"s9","temperature":1.5,"humidity":2,"timestamp":"2024-05-01T12:00:00Z","battery":88}"#;
        let reading: Reading = serde_json::from_str(raw).unwrap();
        assert_eq!(reading.sensor_id, "s9");
        assert_eq!(reading.humidity, 2.0);
        assert!(reading.anomalies.is_empty());
    }
}
