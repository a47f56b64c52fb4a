//! Error types
//!
//! One enum per failure class. None of them is fatal to the process:
//! validation and decode failures stay local to the call that produced them,
//! transport errors are reported while the reconnect loop keeps running.

use std::fmt;
use thiserror::Error;

/// Coordinate axis, used when reporting out-of-range values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    /// Inclusive bounds for this axis in degrees
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Axis::Latitude => (-90.0, 90.0),
            Axis::Longitude => (-180.0, 180.0),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Latitude => write!(f, "latitude"),
            Axis::Longitude => write!(f, "longitude"),
        }
    }
}

/// A coordinate outside its valid range
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{axis} {value} is outside [{}, {}]", .axis.bounds().0, .axis.bounds().1)]
pub struct CoordinateError {
    pub axis: Axis,
    pub value: f64,
}

/// Rejected tracking input, raised before any network action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Tracking code is empty")]
    Empty,

    #[error("Tracking code is longer than {max} characters")]
    TooLong { max: usize },

    #[error("Tracking code {0:?} contains characters outside A-Z, 0-9, '-', '_', '.'")]
    InvalidCharacters(String),
}

/// A payload that could not be turned into a location update
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("Coordinate out of range: {0}")]
    OutOfRange(#[from] CoordinateError),
}

/// Failures reported by the broker or the transport beneath it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection attempt timed out after {0} ms")]
    Timeout(u64),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// Programming errors in how the connection lifecycle is driven
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot subscribe to {topic}: connection is not active")]
    NotActive { topic: String },
}

/// Any error surfaced by the tracking core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Result type alias for tracking operations
pub type TrackingResult<T> = Result<T, TrackingError>;
