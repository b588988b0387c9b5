//! Error types for the migration engine.

use std::time::Duration;

use thiserror::Error;

use crate::core::Provenance;
use crate::retry::ErrorCategory;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, out-of-range values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source is missing, unreadable, or exceeds the configured size limit
    #[error("Source unreadable: {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    /// A single malformed record
    #[error("Decode error at {provenance}: {message}")]
    Decode {
        message: String,
        provenance: Provenance,
    },

    /// Recoverable failure that is still failing after all attempts
    #[error("{category} after {attempts} attempt(s): {message}")]
    Recoverable {
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },

    /// Failure that must not be retried
    #[error("Fatal {category}: {message}")]
    Fatal {
        category: ErrorCategory,
        message: String,
        provenance: Option<Provenance>,
    },

    /// Error raised by a caller-supplied record processor or mutation target
    #[error("Processing failed: {0}")]
    Processing(String),

    /// A batch did not finish within the configured timeout
    #[error("Batch {batch_index} timed out after {timeout:?}")]
    BatchTimeout { batch_index: u64, timeout: Duration },

    /// Checkpoint id does not exist in the store
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Checkpoint data could not be parsed or failed its integrity check
    #[error("Checkpoint {id} is corrupt: {reason}")]
    CheckpointCorrupt { id: String, reason: String },

    /// Checkpoint belongs to a different run
    #[error("Checkpoint {id} belongs to run {found}, expected run {expected}")]
    CheckpointMismatch {
        id: String,
        expected: String,
        found: String,
    },

    /// Operation lacks the data needed to invert it
    #[error("Operation {operation_id} could not safely invert: {reason}")]
    RollbackUnsafe { operation_id: String, reason: String },

    /// Run stopped before the source was exhausted
    #[error("Migration aborted: {reason} (last checkpoint: {})", .last_checkpoint.as_deref().unwrap_or("none"))]
    Aborted {
        reason: String,
        last_checkpoint: Option<String>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        MigrateError::Processing(message.into())
    }

    /// Create a Decode error for a record.
    pub fn decode(message: impl Into<String>, provenance: Provenance) -> Self {
        MigrateError::Decode {
            message: message.into(),
            provenance,
        }
    }

    /// Create a SourceUnreadable error.
    pub fn unreadable(path: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrateError::SourceUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a Fatal error with optional record provenance.
    pub fn fatal(
        category: ErrorCategory,
        message: impl Into<String>,
        provenance: Option<Provenance>,
    ) -> Self {
        MigrateError::Fatal {
            category,
            message: message.into(),
            provenance,
        }
    }

    /// Category attached to this error, if it has already been classified.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            MigrateError::Recoverable { category, .. } | MigrateError::Fatal { category, .. } => {
                Some(*category)
            }
            _ => None,
        }
    }

    /// Record provenance attached to this error, if any.
    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            MigrateError::Decode { provenance, .. } => Some(provenance),
            MigrateError::Fatal { provenance, .. } => provenance.as_ref(),
            _ => None,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_message_names_checkpoint() {
        let err = MigrateError::Aborted {
            reason: "failure ratio exceeded".into(),
            last_checkpoint: Some("cp-7".into()),
        };
        assert!(err.to_string().contains("cp-7"));

        let err = MigrateError::Aborted {
            reason: "x".into(),
            last_checkpoint: None,
        };
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_category_accessor() {
        let err = MigrateError::fatal(ErrorCategory::PermissionDenied, "denied", None);
        assert_eq!(err.category(), Some(ErrorCategory::PermissionDenied));
        assert_eq!(MigrateError::processing("boom").category(), None);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: disk gone"));
    }
}
