//! Calibration record model and its durable JSON contract.
//!
//! A [`Record`] captures one finished calibration pass: the identity of
//! the target (element, absorption edge, insertion-device harmonic),
//! provenance metadata, and the ordered (bragg, gap) measurement pairs the
//! pass produced. The JSON schema is the persistence contract and must
//! round-trip exactly:
//!
//! ```json
//! {
//!   "element": "Fe",
//!   "edge": "K",
//!   "date": "2024-05-01T12:30:00+00:00",
//!   "detector": "diode",
//!   "comment": "gap scan at fitted peak",
//!   "harmonic": 7,
//!   "measurements": [{"bragg": 11.4, "gap": 6.2}]
//! }
//! ```
//!
//! `date` is ISO-8601; `harmonic` tolerates being written as a numeric
//! string by older producers and is coerced to an integer on the way in.

use crate::curvefit::{self, FitError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Insertion-device harmonics this installation can select.
pub const KNOWN_HARMONICS: [u32; 12] = [1, 3, 5, 7, 9, 11, 13, 15, 17, 19, 21, 23];

/// Whether `harmonic` is one of [`KNOWN_HARMONICS`].
pub fn is_known_harmonic(harmonic: u32) -> bool {
    KNOWN_HARMONICS.contains(&harmonic)
}

/// Error from record encoding, decoding or regression.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Persisted record text failed to parse
    #[error("malformed record: {0}")]
    Malformed(serde_json::Error),

    /// Record could not be encoded to JSON
    #[error("failed to encode record: {0}")]
    Encode(serde_json::Error),

    /// Too few measurements for the requested regression
    #[error("insufficient measurements for regression: got {got}, need {need}")]
    InsufficientData { got: usize, need: usize },

    /// Regression fit failed; there is no fallback for table fits
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// One (bragg angle, gap) sample pair. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Monochromator bragg angle
    pub bragg: f64,
    /// Insertion-device gap at peak response for that angle
    pub gap: f64,
}

impl Measurement {
    pub fn new(bragg: f64, gap: f64) -> Self {
        Self { bragg, gap }
    }
}

/// One calibration result: target identity, provenance, and the ordered
/// measurement curve (insertion order = acquisition order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub element: String,
    pub edge: String,
    #[serde(with = "iso8601")]
    pub date: DateTime<Utc>,
    pub detector: String,
    pub comment: String,
    #[serde(deserialize_with = "coerce_harmonic")]
    pub harmonic: u32,
    pub measurements: Vec<Measurement>,
}

impl Record {
    /// Create a record stamped with the current time.
    pub fn new(
        element: impl Into<String>,
        edge: impl Into<String>,
        harmonic: u32,
        detector: impl Into<String>,
        comment: impl Into<String>,
        measurements: Vec<Measurement>,
    ) -> Self {
        Self {
            element: element.into(),
            edge: edge.into(),
            date: Utc::now(),
            detector: detector.into(),
            comment: comment.into(),
            harmonic,
            measurements,
        }
    }

    /// Encode to the durable JSON contract.
    pub fn to_json(&self) -> Result<String, RecordError> {
        serde_json::to_string_pretty(self).map_err(RecordError::Encode)
    }

    /// Decode from the durable JSON contract.
    ///
    /// Missing required fields, an unparseable date, or a harmonic that
    /// cannot be coerced to an integer are all [`RecordError::Malformed`].
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        serde_json::from_str(text).map_err(RecordError::Malformed)
    }

    /// Whether this record is the calibration the caller asked for.
    pub fn matches_identity(&self, harmonic: u32, element: &str, edge: &str) -> bool {
        self.harmonic == harmonic && self.element == element && self.edge == edge
    }

    /// Quadratic regression over the measurement curve.
    ///
    /// Returns `[a, b, c]` with `gap = a*bragg^2 + b*bragg + c`. Needs at
    /// least three measurements (one per free parameter).
    pub fn fit_regression(&self) -> Result<[f64; 3], RecordError> {
        if self.measurements.len() < 3 {
            return Err(RecordError::InsufficientData {
                got: self.measurements.len(),
                need: 3,
            });
        }
        let xs: Vec<f64> = self.measurements.iter().map(|m| m.bragg).collect();
        let ys: Vec<f64> = self.measurements.iter().map(|m| m.gap).collect();
        let coeffs = curvefit::fit_polynomial(&xs, &ys, 2)?;
        Ok([coeffs[0], coeffs[1], coeffs[2]])
    }

    /// Closure evaluating the fitted quadratic at an arbitrary angle.
    ///
    /// Regenerated on demand; nothing is cached beyond the record itself.
    pub fn regression_function(&self) -> Result<impl Fn(f64) -> f64, RecordError> {
        let [a, b, c] = self.fit_regression()?;
        Ok(move |x: f64| (a * x + b) * x + c)
    }
}

/// ISO-8601 date field.
///
/// Serializes as RFC 3339; accepts offset-free timestamps on the way in,
/// which older producers wrote, treating them as UTC.
mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(date) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(date.with_timezone(&Utc));
        }
        raw.parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|e| de::Error::custom(format!("invalid date {raw:?}: {e}")))
    }
}

/// Accepts the harmonic as an integer or a numeric string.
fn coerce_harmonic<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid harmonic {text:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_record() -> Record {
        Record::new(
            "Fe",
            "K",
            7,
            "diode",
            "gap scan at fitted peak",
            vec![
                Measurement::new(11.4, 6.21),
                Measurement::new(11.1, 6.35),
                Measurement::new(10.8, 6.52),
                Measurement::new(10.5, 6.71),
            ],
        )
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let record = sample_record();
        let text = record.to_json().unwrap();
        let restored = Record::from_json(&text).unwrap();
        assert_eq!(restored, record);
        // Order matters: the curve is acquisition-ordered.
        assert_eq!(restored.measurements[0], record.measurements[0]);
        assert_eq!(restored.measurements[3], record.measurements[3]);
    }

    #[test]
    fn parses_offset_free_date_and_string_harmonic() {
        let text = r#"{
            "element": "Mo",
            "edge": "L3",
            "date": "2024-05-01T12:30:00",
            "detector": "diode",
            "comment": "",
            "harmonic": "19",
            "measurements": [{"bragg": 17.3, "gap": 6.0}]
        }"#;
        let record = Record::from_json(text).unwrap();
        assert_eq!(record.harmonic, 19);
        assert_eq!(record.element, "Mo");
        assert_eq!(record.date.to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }

    #[test]
    fn missing_field_is_malformed() {
        let text = r#"{"element": "Fe", "edge": "K"}"#;
        assert!(matches!(
            Record::from_json(text),
            Err(RecordError::Malformed(_))
        ));
    }

    #[test]
    fn uncoercible_harmonic_is_malformed() {
        let text = r#"{
            "element": "Fe",
            "edge": "K",
            "date": "2024-05-01T12:30:00",
            "detector": "diode",
            "comment": "",
            "harmonic": "seventh",
            "measurements": []
        }"#;
        assert!(matches!(
            Record::from_json(text),
            Err(RecordError::Malformed(_))
        ));
    }

    #[test]
    fn regression_recovers_known_quadratic() {
        let measurements: Vec<Measurement> = (0..8)
            .map(|i| {
                let bragg = 10.0 + 0.25 * i as f64;
                Measurement::new(bragg, 0.04 * bragg * bragg - 1.2 * bragg + 14.0)
            })
            .collect();
        let record = Record::new("Fe", "K", 7, "diode", "", measurements);

        let [a, b, c] = record.fit_regression().unwrap();
        assert_relative_eq!(a, 0.04, epsilon = 1e-8);
        assert_relative_eq!(b, -1.2, epsilon = 1e-6);
        assert_relative_eq!(c, 14.0, epsilon = 1e-5);

        let gap = record.regression_function().unwrap();
        assert_relative_eq!(gap(11.0), 0.04 * 121.0 - 1.2 * 11.0 + 14.0, epsilon = 1e-6);
    }

    #[test]
    fn regression_needs_three_measurements() {
        let record = Record::new(
            "Fe",
            "K",
            7,
            "diode",
            "",
            vec![Measurement::new(11.4, 6.2), Measurement::new(11.1, 6.3)],
        );
        assert!(matches!(
            record.fit_regression(),
            Err(RecordError::InsufficientData { got: 2, need: 3 })
        ));
    }

    #[test]
    fn harmonic_set_is_the_odd_harmonics() {
        assert!(is_known_harmonic(1));
        assert!(is_known_harmonic(23));
        assert!(!is_known_harmonic(2));
        assert!(!is_known_harmonic(25));
    }
}
