//! Workload specification types
//!
//! A workload is one image run once in one container, bounded by a deadline.

mod duration {
    pub mod option {
        use humantime::format_duration;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(|e| D::Error::custom(format!("invalid duration: {}", e))),
                None => Ok(None),
            }
        }
    }

    /// Serde module for required (non-Option) Duration fields
    pub mod required {
        use humantime::format_duration;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;
            let s: String = String::deserialize(deserializer)?;
            humantime::parse_duration(&s)
                .map_err(|e| D::Error::custom(format!("invalid duration: {}", e)))
        }
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Default namespace for runlet resources
pub const DEFAULT_NAMESPACE: &str = "runlet";

/// Default run-time budget
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Default stop signal sent when the deadline elapses
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";

/// Top-level workload specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    /// Spec version (must be "v1")
    #[serde(default = "default_version")]
    #[validate(custom(function = "crate::validate::validate_version_wrapper"))]
    pub version: String,

    /// Base name for the container; a unique suffix is appended per run
    #[validate(custom(function = "crate::validate::validate_name_wrapper"))]
    pub name: String,

    /// Container image to run
    #[validate(nested)]
    pub image: ImageSpec,

    /// Runtime namespace grouping every resource of the run
    #[serde(default = "default_namespace")]
    #[validate(custom(function = "crate::validate::validate_namespace_wrapper"))]
    pub namespace: String,

    /// Environment overrides as `KEY=VALUE`; later entries win
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Maximum run time measured from task start
    #[serde(default = "default_deadline", with = "duration::required")]
    pub deadline: Duration,

    /// Signal sent when the deadline elapses
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Time to wait after the stop signal before escalating to SIGKILL.
    /// Unset (the default) sends the stop signal only.
    #[serde(default, with = "duration::option")]
    pub kill_grace: Option<Duration>,

    /// Host namespace sharing
    #[serde(default)]
    pub sharing: NamespaceSharing,

    /// Where the task's stdout/stderr go
    #[serde(default)]
    pub stdio: StdioMode,
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_deadline() -> Duration {
    DEFAULT_DEADLINE
}

fn default_stop_signal() -> String {
    DEFAULT_STOP_SIGNAL.to_string()
}

impl WorkloadSpec {
    /// Create a spec with default settings for the given name and image
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            name: name.into(),
            image: ImageSpec {
                name: image.into(),
                pull_policy: PullPolicy::default(),
            },
            namespace: default_namespace(),
            env: Vec::new(),
            deadline: DEFAULT_DEADLINE,
            stop_signal: default_stop_signal(),
            kill_grace: None,
            sharing: NamespaceSharing::default(),
            stdio: StdioMode::default(),
        }
    }

    /// Environment overrides split into `(key, value)` pairs, in declaration order.
    ///
    /// Entries without `=` are skipped; `validate_workload` rejects them.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

/// Container image specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Image reference (e.g., "docker.io/library/alpine:latest")
    #[validate(custom(function = "crate::validate::validate_image_name_wrapper"))]
    pub name: String,

    /// When to pull the image
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

/// Image pull policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    #[default]
    IfNotPresent,
    /// Never pull, use local image only
    Never,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullPolicy::Always => write!(f, "always"),
            PullPolicy::IfNotPresent => write!(f, "if_not_present"),
            PullPolicy::Never => write!(f, "never"),
        }
    }
}

/// Which host resources the sandbox shares
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct NamespaceSharing {
    /// Join the host network namespace instead of creating one
    #[serde(default)]
    pub host_network: bool,

    /// Bind-mount the host's /etc/hosts
    #[serde(default)]
    pub host_hosts_file: bool,

    /// Bind-mount the host's /etc/resolv.conf
    #[serde(default)]
    pub host_resolv_conf: bool,
}

impl NamespaceSharing {
    /// Share network, hosts file and resolver with the host
    pub fn host() -> Self {
        Self {
            host_network: true,
            host_hosts_file: true,
            host_resolv_conf: true,
        }
    }
}

/// Task standard I/O handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Forward the task's output to this process's stdout/stderr
    #[default]
    Inherit,
    /// Discard the task's output
    Null,
}

impl std::fmt::Display for StdioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdioMode::Inherit => write!(f, "inherit"),
            StdioMode::Null => write!(f, "null"),
        }
    }
}
