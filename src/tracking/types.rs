//! Core data types for location tracking
//!
//! - `LocationUpdate`: one position report for one shipment
//! - `EntityId`: stable shipment identifier assigned by the producer

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::error::{Axis, CoordinateError};

/// Stable identifier of a shipment
pub type EntityId = i64;

/// A single validated position report
///
/// Immutable once constructed. Coordinates are checked on construction, so a
/// value of this type always lies within the valid latitude/longitude ranges.
/// Serializes to the wire shape consumed by [`MessageDecoder`](super::MessageDecoder).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    entity_id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    tracking_code: Option<String>,
    latitude: f64,
    longitude: f64,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    /// Create an update, rejecting coordinates outside their bounds
    pub fn new(
        entity_id: EntityId,
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CoordinateError> {
        check_axis(Axis::Latitude, latitude)?;
        check_axis(Axis::Longitude, longitude)?;

        Ok(Self {
            entity_id,
            tracking_code: None,
            latitude,
            longitude,
            timestamp,
        })
    }

    /// Builder method: attach the human-facing tracking code
    pub fn with_tracking_code(mut self, code: impl Into<String>) -> Self {
        self.tracking_code = Some(code.into());
        self
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn tracking_code(&self) -> Option<&str> {
        self.tracking_code.as_deref()
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Producer-assigned time of the report
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// `(latitude, longitude)` pair, the order map markers expect
    pub fn position(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

fn check_axis(axis: Axis, value: f64) -> Result<(), CoordinateError> {
    let (min, max) = axis.bounds();
    // NaN fails the range check as well
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoordinateError { axis, value })
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_new_accepts_bounds_inclusive() {
        assert!(LocationUpdate::new(1, 90.0, 180.0, ts()).is_ok());
        assert!(LocationUpdate::new(1, -90.0, -180.0, ts()).is_ok());
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        let err = LocationUpdate::new(1, 90.5, 0.0, ts()).unwrap_err();
        assert_eq!(err.axis, Axis::Latitude);

        let err = LocationUpdate::new(1, 0.0, 180.01, ts()).unwrap_err();
        assert_eq!(err.axis, Axis::Longitude);

        assert!(LocationUpdate::new(1, f64::NAN, 0.0, ts()).is_err());
    }

    #[test]
    fn test_serialize_wire_shape() {
        let update = LocationUpdate::new(7, 41.0082, 28.9784, ts())
            .unwrap()
            .with_tracking_code("TR-001");
        let json = serde_json::to_string(&update).unwrap();

        assert!(json.contains("\"entityId\":7"));
        assert!(json.contains("\"trackingCode\":\"TR-001\""));
        assert!(json.contains("\"latitude\":41.0082"));
        assert!(json.contains("\"timestamp\":\"2024-05-01T12:30:00Z\""));
    }

    #[test]
    fn test_serialize_omits_missing_code() {
        let update = LocationUpdate::new(7, 0.0, 0.0, ts()).unwrap();
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("trackingCode"));
    }
}
