//! Error classification into recoverable and fatal categories.

use std::fmt;
use std::io::ErrorKind;

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

/// Failure category assigned by the [`ErrorClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ConnectionTimeout,
    MemoryLimit,
    RateLimit,
    NetworkError,
    TemporaryLock,
    InvalidDataFormat,
    PermissionDenied,
    FileNotFound,
    AuthenticationFailed,
    /// Unmatched. Retried until attempts run out.
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConnectionTimeout => "connection_timeout",
            ErrorCategory::MemoryLimit => "memory_limit",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TemporaryLock => "temporary_lock",
            ErrorCategory::InvalidDataFormat => "invalid_data_format",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::FileNotFound => "file_not_found",
            ErrorCategory::AuthenticationFailed => "authentication_failed",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether failures of this category are worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ConnectionTimeout
                | ErrorCategory::MemoryLimit
                | ErrorCategory::RateLimit
                | ErrorCategory::NetworkError
                | ErrorCategory::TemporaryLock
                | ErrorCategory::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message rule: the first matching rule decides the category.
struct ClassificationRule {
    category: ErrorCategory,
    pattern: Regex,
}

// Recoverable rules come first so "connection timed out while locked" stays retryable.
const RULES: &[(ErrorCategory, &str)] = &[
    (
        ErrorCategory::ConnectionTimeout,
        r"timed?\s?out|timeout|connection (expired|lost)",
    ),
    (
        ErrorCategory::MemoryLimit,
        r"out of memory|memory (limit|exhausted)|allowed memory size|cannot allocate",
    ),
    (
        ErrorCategory::RateLimit,
        r"rate.?limit|too many requests|\b429\b|throttl",
    ),
    (
        ErrorCategory::NetworkError,
        r"network|connection (refused|reset|closed|aborted)|broken pipe|host unreachable|\bdns\b",
    ),
    (
        ErrorCategory::TemporaryLock,
        r"deadlock|lock wait|\blocked\b|try again|resource busy",
    ),
    (
        ErrorCategory::InvalidDataFormat,
        r"invalid (data|format|input|value)|malformed|parse error|syntax error|unexpected (token|character|end)",
    ),
    (
        ErrorCategory::PermissionDenied,
        r"permission denied|access denied|forbidden|not permitted|\b403\b",
    ),
    (
        ErrorCategory::FileNotFound,
        r"no such file|file not found|does not exist",
    ),
    (
        ErrorCategory::AuthenticationFailed,
        r"authentication failed|unauthori[sz]ed|invalid credentials|login failed|\b401\b",
    ),
];

lazy_static! {
    static ref DEFAULT_RULES: Vec<ClassificationRule> = RULES
        .iter()
        .filter_map(|(category, pattern)| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .ok()
                .map(|pattern| ClassificationRule {
                    category: *category,
                    pattern,
                })
        })
        .collect();
}

/// Sorts errors into [`ErrorCategory`] values.
///
/// Typed variants map directly; everything else is matched against ordered
/// message rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error.
    pub fn classify(&self, error: &MigrateError) -> ErrorCategory {
        match error {
            MigrateError::Recoverable { category, .. } | MigrateError::Fatal { category, .. } => {
                *category
            }
            MigrateError::Decode { .. } => ErrorCategory::InvalidDataFormat,
            MigrateError::Json(_) | MigrateError::Yaml(_) => ErrorCategory::InvalidDataFormat,
            MigrateError::CheckpointCorrupt { .. } => ErrorCategory::InvalidDataFormat,
            MigrateError::Config(_) => ErrorCategory::InvalidDataFormat,
            MigrateError::BatchTimeout { .. } => ErrorCategory::ConnectionTimeout,
            MigrateError::CheckpointNotFound(_) => ErrorCategory::FileNotFound,
            MigrateError::Io(e) => match e.kind() {
                ErrorKind::NotFound => ErrorCategory::FileNotFound,
                ErrorKind::PermissionDenied => ErrorCategory::PermissionDenied,
                ErrorKind::TimedOut => ErrorCategory::ConnectionTimeout,
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::NotConnected => ErrorCategory::NetworkError,
                ErrorKind::OutOfMemory => ErrorCategory::MemoryLimit,
                ErrorKind::WouldBlock | ErrorKind::Interrupted => ErrorCategory::TemporaryLock,
                ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                    ErrorCategory::InvalidDataFormat
                }
                _ => self.classify_message(&e.to_string()),
            },
            MigrateError::SourceUnreadable { reason, .. } => match self.classify_message(reason) {
                ErrorCategory::Unknown => ErrorCategory::FileNotFound,
                other => other,
            },
            other => self.classify_message(&other.to_string()),
        }
    }

    /// Classify a free-form failure message.
    pub fn classify_message(&self, message: &str) -> ErrorCategory {
        DEFAULT_RULES
            .iter()
            .find(|rule| rule.pattern.is_match(message))
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Unknown)
    }
}
