//! # Anomaly Classifier
//!
//! Pure rules flagging readings whose temperature or humidity falls outside
//! the expected operating envelope. Both rules are evaluated independently and
//! always in the same order (temperature first), so the label sequence for a
//! given reading never changes between calls.

use std::fmt;

use crate::relay::reading::Reading;

/// Readings hotter than this are anomalous.
pub const TEMPERATURE_MAX: f64 = 60.0;
/// Readings colder than this are anomalous.
pub const TEMPERATURE_MIN: f64 = -10.0;
/// Humidity above this is anomalous.
pub const HUMIDITY_MAX: f64 = 90.0;
/// Humidity below this is anomalous.
pub const HUMIDITY_MIN: f64 = 10.0;

/// A single finding of the classifier, carrying the offending value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anomaly {
    TemperatureOutOfRange(f64),
    HumidityOutOfRange(f64),
}

impl Anomaly {
    /// The label attached to the reading on the wire.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::TemperatureOutOfRange(value) => write!(f, "temperature_out_of_range:{value}"),
            Anomaly::HumidityOutOfRange(value) => write!(f, "humidity_out_of_range:{value}"),
        }
    }
}

/// Classifies `reading` without touching it.
pub fn classify(reading: &Reading) -> Vec<Anomaly> {
    let mut found = Vec::new();
    if reading.temperature > TEMPERATURE_MAX || reading.temperature < TEMPERATURE_MIN {
        found.push(Anomaly::TemperatureOutOfRange(reading.temperature));
    }
    if reading.humidity > HUMIDITY_MAX || reading.humidity < HUMIDITY_MIN {
        found.push(Anomaly::HumidityOutOfRange(reading.humidity));
    }
    found
}

/// Returns `reading` with its anomaly labels set from `classify`.
pub fn tag(reading: Reading) -> Reading {
    let labels = classify(&reading).iter().map(Anomaly::label).collect();
    reading.with_anomalies(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(temperature: f64, humidity: f64) -> Reading {
        Reading::new("s1", temperature, humidity, "2024-05-01T12:00:00Z")
    }

    #[test]
    fn nominal_reading_has_no_anomalies() {
        assert!(classify(&reading(25.0, 50.0)).is_empty());
        assert!(tag(reading(25.0, 50.0)).anomalies.is_empty());
    }

    #[test]
    fn hot_reading_yields_single_temperature_label() {
        let labels = tag(reading(100.0, 85.0)).anomalies;
        assert_eq!(labels, vec!["temperature_out_of_range:100".to_string()]);
    }

    #[test]
    fn both_rules_fire_temperature_first() {
        assert_eq!(
            classify(&reading(-20.5, 95.0)),
            vec![
                Anomaly::TemperatureOutOfRange(-20.5),
                Anomaly::HumidityOutOfRange(95.0)
            ]
        );
    }

    #[test]
    fn thresholds_are_strict() {
        assert!(classify(&reading(TEMPERATURE_MAX, HUMIDITY_MAX)).is_empty());
        assert!(classify(&reading(TEMPERATURE_MIN, HUMIDITY_MIN)).is_empty());
        assert_eq!(classify(&reading(25.0, 9.99)).len(), 1);
    }

    #[test]
    fn classify_is_repeatable() {
        let r = reading(61.0, 5.0);
        assert_eq!(classify(&r), classify(&r));
        assert_eq!(tag(r.clone()), tag(r));
    }

    #[test]
    fn tag_replaces_labels_supplied_by_the_sender() {
        let spoofed = reading(20.0, 50.0).with_anomalies(vec!["bogus".to_string()]);
        assert!(tag(spoofed).anomalies.is_empty());
    }
}
