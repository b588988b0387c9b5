//! Primitive type detectors.
//!
//! A detector answers one question about one value. The analyzer scores each
//! registered detector by its hit rate over a field's non-empty samples; the
//! registry order breaks ties.

use std::net::IpAddr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;

use crate::core::PrimitiveType;

lazy_static! {
    static ref DECIMAL: Option<Regex> =
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").ok();
    static ref EMAIL: Option<Regex> =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").ok();
    static ref URL: Option<Regex> =
        Regex::new(r"^(https?|ftp)://[^\s/$.?#][^\s]*$").ok();
    static ref DATE_SHAPE: Option<Regex> = Regex::new(
        r"^(\d{4}[-/]\d{1,2}[-/]\d{1,2}([ T]\d{1,2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?)?|\d{1,2}/\d{1,2}/\d{4})$"
    )
    .ok();
}

fn matches(pattern: &Option<Regex>, value: &str) -> bool {
    pattern.as_ref().map_or(false, |re| re.is_match(value))
}

/// A named strategy deciding whether a value belongs to one primitive type.
pub trait TypeDetector: Send + Sync {
    /// Detector name, used in logs.
    fn name(&self) -> &'static str;

    /// Type assigned when this detector wins.
    fn primitive(&self) -> PrimitiveType;

    /// Whether `value` (already trimmed, never empty) matches.
    fn detect(&self, value: &str) -> bool;
}

pub struct IntegerDetector;

impl TypeDetector for IntegerDetector {
    fn name(&self) -> &'static str {
        "integer"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Integer
    }

    fn detect(&self, value: &str) -> bool {
        let digits = value.strip_prefix('-').unwrap_or(value);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) && value.parse::<i64>().is_ok()
    }
}

/// Matches any finite decimal notation, integers included.
pub struct DecimalDetector;

impl TypeDetector for DecimalDetector {
    fn name(&self) -> &'static str {
        "decimal"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Decimal
    }

    fn detect(&self, value: &str) -> bool {
        matches(&DECIMAL, value) && value.parse::<f64>().map_or(false, f64::is_finite)
    }
}

const BOOLEAN_TOKENS: &[&str] = &["true", "false", "yes", "no", "y", "n", "t", "f", "on", "off", "1", "0"];

pub struct BooleanDetector;

impl TypeDetector for BooleanDetector {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Boolean
    }

    fn detect(&self, value: &str) -> bool {
        BOOLEAN_TOKENS.iter().any(|t| t.eq_ignore_ascii_case(value))
    }
}

/// Hyphenated UUIDs only.
pub struct UuidDetector;

impl TypeDetector for UuidDetector {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Uuid
    }

    fn detect(&self, value: &str) -> bool {
        value.len() == 36 && uuid::Uuid::parse_str(value).is_ok()
    }
}

pub struct EmailDetector;

impl TypeDetector for EmailDetector {
    fn name(&self) -> &'static str {
        "email"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Email
    }

    fn detect(&self, value: &str) -> bool {
        matches(&EMAIL, value)
    }
}

pub struct UrlDetector;

impl TypeDetector for UrlDetector {
    fn name(&self) -> &'static str {
        "url"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Url
    }

    fn detect(&self, value: &str) -> bool {
        matches(&URL, value)
    }
}

pub struct IpDetector;

impl TypeDetector for IpDetector {
    fn name(&self) -> &'static str {
        "ip"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Ip
    }

    fn detect(&self, value: &str) -> bool {
        value.parse::<IpAddr>().is_ok()
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Requires both the date shape and a successful calendar parse.
pub struct DateDetector;

impl DateDetector {
    fn parses(value: &str) -> bool {
        DateTime::parse_from_rfc3339(value).is_ok()
            || DATE_FORMATS
                .iter()
                .any(|f| NaiveDate::parse_from_str(value, f).is_ok())
            || DATETIME_FORMATS
                .iter()
                .any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
    }
}

impl TypeDetector for DateDetector {
    fn name(&self) -> &'static str {
        "date"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Date
    }

    fn detect(&self, value: &str) -> bool {
        matches(&DATE_SHAPE, value) && Self::parses(value)
    }
}

/// JSON objects and arrays.
pub struct JsonDetector;

impl TypeDetector for JsonDetector {
    fn name(&self) -> &'static str {
        "json"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::Json
    }

    fn detect(&self, value: &str) -> bool {
        (value.starts_with('{') || value.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(value).is_ok()
    }
}

/// Fallback that matches everything.
pub struct TextDetector;

impl TypeDetector for TextDetector {
    fn name(&self) -> &'static str {
        "text"
    }

    fn primitive(&self) -> PrimitiveType {
        PrimitiveType::String
    }

    fn detect(&self, _value: &str) -> bool {
        true
    }
}

/// Ordered list of detectors. Earlier entries win ties.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn TypeDetector>>,
}

impl DetectorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// Append a detector after the existing ones.
    pub fn register(&mut self, detector: Box<dyn TypeDetector>) {
        self.detectors.push(detector);
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn TypeDetector> {
        self.detectors.get(index).map(|d| d.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn TypeDetector> {
        self.detectors.iter().map(|d| d.as_ref())
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(IntegerDetector));
        registry.register(Box::new(DecimalDetector));
        registry.register(Box::new(BooleanDetector));
        registry.register(Box::new(UuidDetector));
        registry.register(Box::new(EmailDetector));
        registry.register(Box::new(UrlDetector));
        registry.register(Box::new(IpDetector));
        registry.register(Box::new(DateDetector));
        registry.register(Box::new(JsonDetector));
        registry.register(Box::new(TextDetector));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_detectors() {
        assert!(IntegerDetector.detect("42"));
        assert!(IntegerDetector.detect("-7"));
        assert!(!IntegerDetector.detect("4.2"));
        assert!(!IntegerDetector.detect("99999999999999999999"));

        assert!(DecimalDetector.detect("4.2"));
        assert!(DecimalDetector.detect("42"));
        assert!(DecimalDetector.detect("-1.5e3"));
        assert!(!DecimalDetector.detect("1.2.3"));
        assert!(!DecimalDetector.detect("abc"));
    }

    #[test]
    fn test_date_requires_shape_and_parse() {
        assert!(DateDetector.detect("2024-01-15"));
        assert!(DateDetector.detect("2024-01-15 10:30:00"));
        assert!(DateDetector.detect("2024-01-15T10:30:00Z"));
        // Shape matches but the calendar rejects it.
        assert!(!DateDetector.detect("2024-13-45"));
        // Parseable by some format but not date-shaped.
        assert!(!DateDetector.detect("20240115"));
    }

    #[test]
    fn test_string_shaped_detectors() {
        assert!(EmailDetector.detect("a@x.com"));
        assert!(!EmailDetector.detect("a@x"));
        assert!(UrlDetector.detect("https://example.com/a?b=1"));
        assert!(!UrlDetector.detect("example.com"));
        assert!(IpDetector.detect("10.0.0.1"));
        assert!(IpDetector.detect("::1"));
        assert!(UuidDetector.detect("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!UuidDetector.detect("550e8400e29b41d4a716446655440000"));
        assert!(JsonDetector.detect(r#"{"a": 1}"#));
        assert!(!JsonDetector.detect("1"));
        assert!(BooleanDetector.detect("Yes"));
        assert!(TextDetector.detect("anything"));
    }

    #[test]
    fn test_default_registry_order() {
        let registry = DetectorRegistry::default();
        let order: Vec<PrimitiveType> = registry.iter().map(|d| d.primitive()).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(registry.len(), 10);
    }
}
