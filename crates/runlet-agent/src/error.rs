//! Agent-specific errors

use thiserror::Error;

/// Lifecycle errors, one variant per stage that can fail
#[derive(Debug, Error)]
pub enum AgentError {
    /// Image could not be fetched (network, registry, or missing locally)
    #[error("Failed to fetch image '{image}': {reason}")]
    ImageFetch { image: String, reason: String },

    /// Image manifest or config is malformed
    #[error("Invalid image '{image}': {reason}")]
    ImageFormat { image: String, reason: String },

    /// Sandbox spec could not be built from the image and overrides
    #[error("Failed to build sandbox spec: {0}")]
    SpecBuild(String),

    /// Container or its snapshot could not be created
    #[error("Failed to create container '{id}': {reason}")]
    ContainerCreate { id: String, reason: String },

    /// Task could not be created inside the container
    #[error("Failed to create task for '{id}': {reason}")]
    TaskCreate { id: String, reason: String },

    /// Runtime rejected the process launch
    #[error("Failed to start task '{id}': {reason}")]
    TaskStart { id: String, reason: String },

    /// Signal delivery failed
    #[error("Failed to signal task '{id}': {reason}")]
    TaskKill { id: String, reason: String },

    /// Task resources could not be released
    #[error("Failed to delete task '{id}': {reason}")]
    TaskDelete { id: String, reason: String },

    /// Container or snapshot could not be removed
    #[error("Failed to delete container '{id}': {reason}")]
    ContainerDelete { id: String, reason: String },

    /// Exit observation failed before an exit status arrived
    #[error("Failed to observe exit of '{id}': {reason}")]
    Watch { id: String, reason: String },

    /// Operation is not valid in the task's current state
    #[error("Cannot {operation} task '{id}' in state {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: String,
    },

    /// Task start attempted before an exit watcher was registered
    #[error("Task '{id}' must have an exit watcher registered before start")]
    ExitNotWatched { id: String },

    /// The run was cancelled by the caller
    #[error("Run cancelled")]
    Cancelled,

    /// Configuration error (missing or invalid configuration)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short name of the lifecycle stage that produced this error
    pub fn stage(&self) -> &'static str {
        match self {
            AgentError::ImageFetch { .. } => "image-fetch",
            AgentError::ImageFormat { .. } => "image-format",
            AgentError::SpecBuild(_) => "spec-build",
            AgentError::ContainerCreate { .. } => "container-create",
            AgentError::TaskCreate { .. } => "task-create",
            AgentError::TaskStart { .. } => "task-start",
            AgentError::TaskKill { .. } => "task-kill",
            AgentError::TaskDelete { .. } => "task-delete",
            AgentError::ContainerDelete { .. } => "container-delete",
            AgentError::Watch { .. } => "watch",
            AgentError::InvalidState { .. } => "invalid-state",
            AgentError::ExitNotWatched { .. } => "exit-not-watched",
            AgentError::Cancelled => "cancelled",
            AgentError::Configuration(_) => "configuration",
            AgentError::Internal(_) => "internal",
        }
    }
}

/// Every failure hit while releasing resources, in the order encountered
#[derive(Debug, Error)]
#[error("{} cleanup failure(s): {}", failures.len(), summarize(failures))]
pub struct CleanupError {
    pub failures: Vec<AgentError>,
}

fn summarize(failures: &[AgentError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failed run: the error that stopped it, plus anything cleanup hit afterwards
#[derive(Debug, Error)]
#[error("{primary}")]
pub struct RunError {
    #[source]
    pub primary: AgentError,
    pub cleanup: Option<CleanupError>,
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
