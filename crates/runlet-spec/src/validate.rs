//! Validation functions for workload specifications

use crate::error::{ValidationError, ValidationErrorKind};
use crate::types::WorkloadSpec;
use std::time::Duration;

/// Longest base name accepted; leaves room for the run suffix and `-snapshot`.
pub const MAX_NAME_LEN: usize = 63;

// =============================================================================
// Validator crate wrapper functions
// =============================================================================

fn make_validation_error(
    code: &'static str,
    message: impl Into<std::borrow::Cow<'static, str>>,
) -> validator::ValidationError {
    let mut err = validator::ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Wrapper for validate_version for use with validator crate
pub fn validate_version_wrapper(version: &str) -> Result<(), validator::ValidationError> {
    if version == "v1" {
        Ok(())
    } else {
        Err(make_validation_error(
            "invalid_version",
            format!("version must be 'v1', found '{}'", version),
        ))
    }
}

/// Container base names follow containerd identifier rules:
/// alphanumeric segments joined by `.`, `_` or `-`.
pub fn validate_name_wrapper(name: &str) -> Result<(), validator::ValidationError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(make_validation_error(
            "invalid_name",
            format!("name must be 1-{} characters", MAX_NAME_LEN),
        ));
    }
    if !is_identifier(name) {
        return Err(make_validation_error(
            "invalid_name",
            "name must be alphanumeric segments separated by '.', '_' or '-'",
        ));
    }
    Ok(())
}

/// Namespaces follow the same identifier rules as names
pub fn validate_namespace_wrapper(namespace: &str) -> Result<(), validator::ValidationError> {
    if namespace.is_empty() || !is_identifier(namespace) {
        return Err(make_validation_error(
            "invalid_namespace",
            "namespace must be alphanumeric segments separated by '.', '_' or '-'",
        ));
    }
    Ok(())
}

/// Wrapper for validate_image_name for use with validator crate
pub fn validate_image_name_wrapper(name: &str) -> Result<(), validator::ValidationError> {
    if name.trim().is_empty() {
        Err(make_validation_error(
            "empty_image_name",
            "image name cannot be empty",
        ))
    } else if name.chars().any(char::is_whitespace) {
        Err(make_validation_error(
            "invalid_image_name",
            "image name cannot contain whitespace",
        ))
    } else {
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut prev_sep = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            prev_sep = false;
        } else if matches!(c, '.' | '_' | '-') {
            if prev_sep {
                return false;
            }
            prev_sep = true;
        } else {
            return false;
        }
    }
    !prev_sep
}

// =============================================================================
// Cross-field validation
// =============================================================================

/// Validate the parts of a workload the derive cannot express
pub fn validate_workload(spec: &WorkloadSpec) -> Result<(), ValidationError> {
    for (i, entry) in spec.env.iter().enumerate() {
        validate_env_entry(entry).map_err(|kind| ValidationError {
            kind,
            path: format!("env[{}]", i),
        })?;
    }

    if spec.deadline == Duration::ZERO {
        return Err(ValidationError {
            kind: ValidationErrorKind::ZeroDeadline,
            path: "deadline".to_string(),
        });
    }

    if spec.kill_grace == Some(Duration::ZERO) {
        return Err(ValidationError {
            kind: ValidationErrorKind::ZeroKillGrace,
            path: "kill_grace".to_string(),
        });
    }

    if spec.stop_signal.trim().is_empty() {
        return Err(ValidationError {
            kind: ValidationErrorKind::EmptyStopSignal,
            path: "stop_signal".to_string(),
        });
    }

    Ok(())
}

/// An environment entry must be `KEY=VALUE` with a non-empty key free of
/// whitespace and `=`.
pub fn validate_env_entry(entry: &str) -> Result<(), ValidationErrorKind> {
    let invalid = || ValidationErrorKind::InvalidEnvVar {
        entry: entry.to_string(),
    };
    let (key, _) = entry.split_once('=').ok_or_else(invalid)?;
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(())
}
