//! Message Decoder
//!
//! Turns raw broker payloads into validated [`LocationUpdate`] values.
//!
//! ## Wire format
//!
//! ```json
//! {"entityId": 42, "trackingCode": "TR-001", "latitude": 41.0082,
//!  "longitude": 28.9784, "timestamp": "2024-05-01T12:30:00Z"}
//! ```
//!
//! `cargoId` and `trackingNumber` are accepted as aliases for `entityId` and
//! `trackingCode`. `timestamp` may also be a zone-less local date-time, which
//! is read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use super::types::LocationUpdate;
use crate::error::DecodeError;

const ENTITY_ID: &[&str] = &["entityId", "cargoId"];
const TRACKING_CODE: &[&str] = &["trackingCode", "trackingNumber"];
const LATITUDE: &[&str] = &["latitude"];
const LONGITUDE: &[&str] = &["longitude"];
const TIMESTAMP: &[&str] = &["timestamp"];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Decoder configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Reject payloads that carry fields outside the wire schema
    pub strict: bool,
    /// Largest accepted payload in bytes
    pub max_payload_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            strict: true,
            max_payload_bytes: 64 * 1024,
        }
    }
}

/// Parses and validates location payloads
#[derive(Debug, Clone, Default)]
pub struct MessageDecoder {
    config: DecoderConfig,
}

impl MessageDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decoder that ignores unknown fields
    pub fn lenient() -> Self {
        Self::new(DecoderConfig {
            strict: false,
            ..DecoderConfig::default()
        })
    }

    /// Decode one payload
    ///
    /// Failures are local: the caller reports them and keeps consuming the
    /// subscription.
    pub fn decode(&self, raw: &str) -> Result<LocationUpdate, DecodeError> {
        if raw.len() > self.config.max_payload_bytes {
            return Err(DecodeError::TooLarge {
                size: raw.len(),
                limit: self.config.max_payload_bytes,
            });
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if self.config.strict {
            if let Some(unknown) = fields.keys().find(|key| !is_known_field(key)) {
                return Err(DecodeError::UnknownField(unknown.clone()));
            }
        }

        let entity_id = required(&fields, ENTITY_ID)?
            .as_i64()
            .ok_or_else(|| invalid(ENTITY_ID[0], "expected an integer"))?;
        let latitude = number(&fields, LATITUDE)?;
        let longitude = number(&fields, LONGITUDE)?;
        let timestamp = match required(&fields, TIMESTAMP)? {
            Value::String(s) => parse_timestamp(s)?,
            _ => return Err(invalid(TIMESTAMP[0], "expected a string")),
        };
        let tracking_code = match lookup(&fields, TRACKING_CODE) {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code.clone()),
            Some(_) => return Err(invalid(TRACKING_CODE[0], "expected a string")),
        };

        let update = LocationUpdate::new(entity_id, latitude, longitude, timestamp)?;
        Ok(match tracking_code {
            Some(code) => update.with_tracking_code(code),
            None => update,
        })
    }
}

fn is_known_field(key: &str) -> bool {
    [ENTITY_ID, TRACKING_CODE, LATITUDE, LONGITUDE, TIMESTAMP]
        .iter()
        .any(|names| names.contains(&key))
}

fn lookup<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| fields.get(*name))
}

fn required<'a>(
    fields: &'a Map<String, Value>,
    names: &[&'static str],
) -> Result<&'a Value, DecodeError> {
    match lookup(fields, names) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(names[0])),
        Some(value) => Ok(value),
    }
}

fn number(fields: &Map<String, Value>, names: &[&'static str]) -> Result<f64, DecodeError> {
    required(fields, names)?
        .as_f64()
        .ok_or_else(|| invalid(names[0], "expected a number"))
}

fn invalid(field: &'static str, reason: &str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DecodeError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Axis;
    use chrono::TimeZone;

    const VALID: &str = r#"{"entityId": 42, "trackingCode": "TR-001", "latitude": 41.0082, "longitude": 28.9784, "timestamp": "2024-05-01T12:30:00Z"}"#;

    #[test]
    fn test_decode_valid_payload() {
        let update = MessageDecoder::default().decode(VALID).unwrap();
        assert_eq!(update.entity_id(), 42);
        assert_eq!(update.tracking_code(), Some("TR-001"));
        assert_eq!(update.position(), (41.0082, 28.9784));
        assert_eq!(
            update.timestamp(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_round_trip() {
        let decoder = MessageDecoder::default();
        let samples = [
            LocationUpdate::new(1, 0.0, 0.0, Utc.timestamp_millis_opt(1_714_566_600_123).unwrap())
                .unwrap(),
            LocationUpdate::new(2, -90.0, 180.0, Utc::now())
                .unwrap()
                .with_tracking_code("TR-002"),
            LocationUpdate::new(i64::MAX, 12.345678901, -98.7654321, Utc::now()).unwrap(),
        ];

        for original in samples {
            let wire = serde_json::to_string(&original).unwrap();
            assert_eq!(decoder.decode(&wire).unwrap(), original);
        }
    }

    #[test]
    fn test_field_aliases() {
        let raw = r#"{"cargoId": 3, "trackingNumber": "TR-003", "latitude": 41.0, "longitude": 29.0, "timestamp": "2024-05-01T12:30:00.250"}"#;
        let update = MessageDecoder::default().decode(raw).unwrap();
        assert_eq!(update.entity_id(), 3);
        assert_eq!(update.tracking_code(), Some("TR-003"));
        assert_eq!(update.timestamp().timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_missing_latitude() {
        let raw = r#"{"entityId": 1, "longitude": 28.9, "timestamp": "2024-05-01T12:30:00Z"}"#;
        let err = MessageDecoder::default().decode(raw).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("latitude"));
    }

    #[test]
    fn test_latitude_out_of_range() {
        let raw = r#"{"entityId": 1, "latitude": 200, "longitude": 28.9, "timestamp": "2024-05-01T12:30:00Z"}"#;
        let err = MessageDecoder::default().decode(raw).unwrap_err();
        match err {
            DecodeError::OutOfRange(e) => {
                assert_eq!(e.axis, Axis::Latitude);
                assert_eq!(e.value, 200.0);
            }
            other => panic!("Expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_shapes() {
        let decoder = MessageDecoder::default();

        assert!(matches!(decoder.decode("not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(decoder.decode("[1, 2]"), Err(DecodeError::NotAnObject));

        let raw = r#"{"entityId": 1.5, "latitude": 1, "longitude": 1, "timestamp": "2024-05-01T12:30:00Z"}"#;
        assert!(matches!(
            decoder.decode(raw),
            Err(DecodeError::InvalidField { field: "entityId", .. })
        ));

        let raw = r#"{"entityId": 1, "latitude": "41", "longitude": 1, "timestamp": "2024-05-01T12:30:00Z"}"#;
        assert!(matches!(
            decoder.decode(raw),
            Err(DecodeError::InvalidField { field: "latitude", .. })
        ));

        let raw = r#"{"entityId": 1, "latitude": 1, "longitude": 1, "timestamp": 1714566600}"#;
        assert!(matches!(
            decoder.decode(raw),
            Err(DecodeError::InvalidField { field: "timestamp", .. })
        ));

        let raw = r#"{"entityId": 1, "latitude": 1, "longitude": 1, "timestamp": "yesterday"}"#;
        assert!(matches!(decoder.decode(raw), Err(DecodeError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_null_tracking_code_is_absent() {
        let raw = r#"{"entityId": 1, "trackingCode": null, "latitude": 1, "longitude": 1, "timestamp": "2024-05-01T12:30:00Z"}"#;
        let update = MessageDecoder::default().decode(raw).unwrap();
        assert_eq!(update.tracking_code(), None);
    }

    #[test]
    fn test_unknown_fields_strict_vs_lenient() {
        let raw = r#"{"entityId": 1, "latitude": 1, "longitude": 1, "timestamp": "2024-05-01T12:30:00Z", "speed": 80}"#;

        assert_eq!(
            MessageDecoder::default().decode(raw),
            Err(DecodeError::UnknownField("speed".to_string()))
        );
        assert!(MessageDecoder::lenient().decode(raw).is_ok());
    }

    #[test]
    fn test_payload_size_limit() {
        let decoder = MessageDecoder::new(DecoderConfig {
            strict: true,
            max_payload_bytes: 16,
        });
        assert!(matches!(
            decoder.decode(VALID),
            Err(DecodeError::TooLarge { limit: 16, .. })
        ));
    }
}
