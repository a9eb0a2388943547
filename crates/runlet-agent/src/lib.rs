//! runlet agent - single workload lifecycle
//!
//! Resolves an image, creates a container and task from it, enforces a run-time
//! deadline, and releases every runtime resource on the way out.

pub mod cleanup;
pub mod container;
pub mod containerd_runtime;
pub mod error;
pub mod exit;
pub mod image;
pub mod orchestrator;
pub mod runtime;
pub mod sandbox;
pub mod task;
pub mod terminator;
pub mod user;

pub use cleanup::{CleanupCoordinator, ResourceScope};
pub use container::{ClockSeed, Container, ContainerFactory, FixedSeed, SeedSource};
pub use containerd_runtime::{ContainerdConfig, ContainerdRuntime};
pub use error::*;
pub use exit::{ExitFuture, ExitResult, ExitWatcher};
pub use image::{Image, ImageProcess, ImageProvider};
pub use orchestrator::{parse_signal, RunOutcome, WorkloadRunner};
pub use runtime::*;
pub use sandbox::{SandboxSpec, SandboxSpecBuilder};
pub use task::{Task, TaskController, TaskState};
pub use terminator::{Termination, TerminationCause, Terminator};
pub use user::{resolve_user, ResolvedUser};

use std::sync::Arc;
use std::time::Duration;

/// Behaviour of the mock runtime when selected from configuration
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub namespace: String,
    /// How long every workload runs before exiting
    pub run_time: Duration,
    /// Exit code every workload reports
    pub exit_code: u32,
    /// Operations that fail
    pub fail_at: Vec<FailPoint>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            namespace: runlet_spec::DEFAULT_NAMESPACE.to_string(),
            run_time: Duration::from_secs(1),
            exit_code: 0,
            fail_at: Vec::new(),
        }
    }
}

/// Configuration for selecting and configuring a container runtime
#[derive(Debug, Clone)]
pub enum RuntimeConfig {
    /// In-memory runtime; every image reference resolves to the same workload
    Mock(MockConfig),
    /// containerd over its gRPC socket
    Containerd(ContainerdConfig),
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::Containerd(ContainerdConfig::default())
    }
}

impl RuntimeConfig {
    pub fn namespace(&self) -> &str {
        match self {
            RuntimeConfig::Mock(c) => &c.namespace,
            RuntimeConfig::Containerd(c) => &c.namespace,
        }
    }
}

/// Create a runtime based on the provided configuration
///
/// # Errors
/// Returns `AgentError` if the runtime cannot be initialized (e.g. the
/// containerd socket is unreachable or the state directory can't be created)
pub async fn create_runtime(config: RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config {
        RuntimeConfig::Mock(mock) => {
            let runtime = mock.fail_at.iter().fold(
                MockRuntime::new()
                    .with_namespace(mock.namespace)
                    .with_default_workload(MockWorkload::new(mock.run_time, mock.exit_code)),
                |runtime, point| runtime.failing_at(*point),
            );
            Ok(Arc::new(runtime))
        }
        RuntimeConfig::Containerd(containerd) => {
            let runtime = ContainerdRuntime::new(containerd).await?;
            Ok(Arc::new(runtime))
        }
    }
}
