//! Error types for the spec crate

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when parsing or validating a workload spec
#[derive(Debug, Error)]
pub enum SpecError {
    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO error when reading spec file
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validation errors for workload specs
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The kind of validation error
    pub kind: ValidationErrorKind,

    /// Path to the invalid field
    pub path: String,
}

/// The specific kind of validation error
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationErrorKind {
    /// Environment entry is not `KEY=VALUE` or has an invalid key
    InvalidEnvVar { entry: String },

    /// Deadline must be positive
    ZeroDeadline,

    /// Kill grace, when set, must be positive
    ZeroKillGrace,

    /// Stop signal is empty
    EmptyStopSignal,

    /// Generic validation error (from validator crate)
    Generic { message: String },
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvVar { entry } => {
                write!(f, "invalid environment entry '{}' (expected KEY=VALUE)", entry)
            }
            Self::ZeroDeadline => write!(f, "deadline must be greater than zero"),
            Self::ZeroKillGrace => write!(f, "kill grace must be greater than zero when set"),
            Self::EmptyStopSignal => write!(f, "stop signal is empty"),
            Self::Generic { message } => write!(f, "{}", message),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} at {}", self.kind, self.path)
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError {
            kind: ValidationErrorKind::InvalidEnvVar {
                entry: "PORT".to_string(),
            },
            path: "env[0]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid environment entry 'PORT' (expected KEY=VALUE) at env[0]"
        );
    }

    #[test]
    fn test_generic_error_without_path() {
        let err = ValidationError {
            kind: ValidationErrorKind::Generic {
                message: "name: bad".to_string(),
            },
            path: String::new(),
        };
        assert_eq!(err.to_string(), "name: bad");
    }
}
