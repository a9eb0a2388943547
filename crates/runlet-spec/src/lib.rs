//! runlet workload specification
//!
//! Types for describing a single run-to-completion container workload, plus
//! YAML parsing and validation.

mod error;
mod types;
mod validate;

pub use error::*;
pub use types::*;
pub use validate::*;

use validator::Validate;

/// Parse a workload spec from YAML string
pub fn from_yaml_str(yaml: &str) -> Result<WorkloadSpec, SpecError> {
    let spec: WorkloadSpec = serde_yaml::from_str(yaml)?;
    validate_spec(&spec)?;
    Ok(spec)
}

/// Parse a workload spec from YAML file
pub fn from_yaml_file(path: &std::path::Path) -> Result<WorkloadSpec, SpecError> {
    let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_yaml_str(&content)
}

/// Run derive and cross-field validation on an already-built spec
pub fn validate_spec(spec: &WorkloadSpec) -> Result<(), SpecError> {
    spec.validate().map_err(|e| {
        SpecError::Validation(ValidationError {
            kind: ValidationErrorKind::Generic {
                message: e.to_string(),
            },
            path: String::new(),
        })
    })?;

    validate_workload(spec)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_from_yaml_str() {
        let yaml = r#"
version: v1
name: simple-api
image:
  name: docker.io/khaosdoctor/simple-node-api:latest
env:
  - PORT=8080
"#;
        let spec = from_yaml_str(yaml).unwrap();
        assert_eq!(spec.name, "simple-api");
        assert_eq!(spec.env, vec!["PORT=8080".to_string()]);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let yaml = r#"
version: v2
name: simple-api
image:
  name: alpine:latest
"#;
        let err = from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, SpecError::Validation(_)));
        assert!(err.to_string().contains("version must be 'v1'"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let yaml = r#"
name: "bad name"
image:
  name: alpine:latest
"#;
        assert!(matches!(
            from_yaml_str(yaml),
            Err(SpecError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_image_rejected() {
        let yaml = r#"
name: app
image:
  name: ""
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_bad_namespace_rejected() {
        let yaml = r#"
name: app
image:
  name: alpine:latest
namespace: "a/b"
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_cross_field_validation_runs() {
        let yaml = r#"
name: app
image:
  name: alpine:latest
env:
  - NOT_AN_ASSIGNMENT
"#;
        let err = from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("env[0]"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: app\nimage:\n  name: alpine:latest\ndeadline: 2s"
        )
        .unwrap();

        let spec = from_yaml_file(file.path()).unwrap();
        assert_eq!(spec.deadline, std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_from_yaml_file_missing() {
        let err = from_yaml_file(std::path::Path::new("/nonexistent/runlet.yaml")).unwrap_err();
        match err {
            SpecError::Io { path, .. } => {
                assert_eq!(path, std::path::PathBuf::from("/nonexistent/runlet.yaml"))
            }
            other => panic!("expected Io error, got {:?}", other),
        }
    }
}
