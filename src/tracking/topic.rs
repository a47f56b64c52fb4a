//! Topic derivation
//!
//! Two topic shapes exist on the broker:
//! - the broadcast topic (`all-cargos` by default) carrying every shipment
//! - per-code topics `tracking/{CODE}`, where `CODE` is the user's input
//!   trimmed and uppercased

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::ValidationError;

/// Longest accepted tracking code after normalization
pub const MAX_CODE_LEN: usize = 64;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9._-]+$").expect("tracking code pattern is valid")
});

/// Trim and uppercase a raw tracking code, then validate it
pub fn normalize_tracking_code(raw: &str) -> Result<String, ValidationError> {
    let code = raw.trim().to_uppercase();

    if code.is_empty() {
        return Err(ValidationError::Empty);
    }
    if code.chars().count() > MAX_CODE_LEN {
        return Err(ValidationError::TooLong { max: MAX_CODE_LEN });
    }
    if !CODE_PATTERN.is_match(&code) {
        return Err(ValidationError::InvalidCharacters(code));
    }

    Ok(code)
}

/// What a topic carries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Updates for every shipment
    Broadcast,
    /// Updates for one tracking code
    Tracking { code: String },
}

/// A derived broker topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    kind: TopicKind,
}

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TopicKind {
        &self.kind
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.kind, TopicKind::Broadcast)
    }

    /// Normalized tracking code, for per-code topics
    pub fn tracking_code(&self) -> Option<&str> {
        match &self.kind {
            TopicKind::Tracking { code } => Some(code),
            TopicKind::Broadcast => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Topic naming rules
#[derive(Debug, Clone)]
pub struct TopicScheme {
    pub broadcast: String,
    pub tracking_prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            broadcast: "all-cargos".to_string(),
            tracking_prefix: "tracking".to_string(),
        }
    }
}

impl TopicScheme {
    /// The fixed topic consumed by the dispatch view
    pub fn broadcast(&self) -> Topic {
        Topic {
            name: self.broadcast.clone(),
            kind: TopicKind::Broadcast,
        }
    }

    /// Per-code topic for raw user input
    pub fn tracking(&self, raw_code: &str) -> Result<Topic, ValidationError> {
        let code = normalize_tracking_code(raw_code)?;
        Ok(Topic {
            name: format!("{}/{}", self.tracking_prefix, code),
            kind: TopicKind::Tracking { code },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_tracking_code("  tr-001 \n").unwrap(), "TR-001");
        assert_eq!(normalize_tracking_code("abc_9.x").unwrap(), "ABC_9.X");
    }

    #[test]
    fn test_empty_input_rejected() {
        assert_eq!(normalize_tracking_code(""), Err(ValidationError::Empty));
        assert_eq!(normalize_tracking_code("   \t"), Err(ValidationError::Empty));
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(matches!(
            normalize_tracking_code("tr/001"),
            Err(ValidationError::InvalidCharacters(_))
        ));
        assert!(matches!(
            normalize_tracking_code("TR 001"),
            Err(ValidationError::InvalidCharacters(_))
        ));
        assert!(matches!(
            normalize_tracking_code("#"),
            Err(ValidationError::InvalidCharacters(_))
        ));

        let long = "A".repeat(MAX_CODE_LEN + 1);
        assert_eq!(
            normalize_tracking_code(&long),
            Err(ValidationError::TooLong { max: MAX_CODE_LEN })
        );
    }

    #[test]
    fn test_topic_derivation() {
        let scheme = TopicScheme::default();

        let topic = scheme.tracking(" tr-001 ").unwrap();
        assert_eq!(topic.as_str(), "tracking/TR-001");
        assert_eq!(topic.tracking_code(), Some("TR-001"));
        assert!(!topic.is_broadcast());

        let broadcast = scheme.broadcast();
        assert_eq!(broadcast.to_string(), "all-cargos");
        assert!(broadcast.is_broadcast());
    }
}
