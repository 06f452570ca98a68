//! Error types for the trigger scheduler

use std::io;
use thiserror::Error;

/// Trigger error type
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Location not found: {0}")]
    LocationNotFound(String),

    #[error("Invalid archive interval: start {start} is after end {end}")]
    InvalidInterval { start: String, end: String },

    #[error("{operation} is not applicable: {reason}")]
    NotApplicable {
        operation: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Read failed for '{path}': {message}")]
    Read { path: String, message: String },
}

impl TriggerError {
    pub(crate) fn not_applicable(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::NotApplicable {
            operation,
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to the fatal construction class.
    ///
    /// Construction errors are detected before the first poll and are never
    /// produced by a running session.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::LocationNotFound(_)
                | Self::InvalidInterval { .. }
                | Self::NotApplicable { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Recoverable failure while reading a latest-data source.
///
/// Never crosses the engine boundary: the watcher logs it and treats the
/// poll as "no candidate".
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("transient IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed record: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_classification() {
        assert!(TriggerError::Config("bad".into()).is_construction());
        assert!(TriggerError::LocationNotFound("/nope".into()).is_construction());
        assert!(TriggerError::not_applicable("rewind", "realtime").is_construction());
        let io = TriggerError::Io(io::Error::new(io::ErrorKind::Other, "x"));
        assert!(!io.is_construction());
    }

    #[test]
    fn test_not_applicable_message() {
        let err = TriggerError::not_applicable("set_nowait", "archive mode never blocks");
        assert_eq!(
            err.to_string(),
            "set_nowait is not applicable: archive mode never blocks"
        );
    }
}
