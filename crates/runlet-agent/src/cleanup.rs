//! Resource release
//!
//! A [`ResourceScope`] owns everything a run allocates. The
//! [`CleanupCoordinator`] releases it in reverse acquisition order, each
//! resource exactly once, collecting failures instead of stopping at the first.

use crate::container::Container;
use crate::error::{AgentError, CleanupError, Result};
use crate::runtime::ContainerRuntime;
use crate::task::{Task, TaskController, TaskState};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// How long cleanup waits for a killed task to report its exit
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resources owned by one run
pub struct ResourceScope {
    runtime: Arc<dyn ContainerRuntime>,
    container: Option<Container>,
    task: Option<Task>,
}

impl ResourceScope {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            container: None,
            task: None,
        }
    }

    /// Take ownership of the run's container
    pub fn adopt_container(&mut self, container: Container) -> &mut Container {
        self.container.insert(container)
    }

    /// Take ownership of the run's task
    pub fn adopt_task(&mut self, task: Task) -> &mut Task {
        self.task.insert(task)
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_none() && self.task.is_none()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }

        let container = self.container.take();
        let task = self.task.take();
        let id = container.as_ref().map(|c| c.id.clone()).unwrap_or_default();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                container = %id,
                "Resource scope dropped outside a runtime, resources leaked"
            );
            return;
        };

        tracing::warn!(
            container = %id,
            "Resource scope dropped without release, releasing in background"
        );
        let runtime = Arc::clone(&self.runtime);
        handle.spawn(async move {
            let coordinator = CleanupCoordinator::new(Arc::clone(&runtime));
            let mut scope = ResourceScope {
                runtime,
                container,
                task,
            };
            if let Err(e) = coordinator.release(&mut scope).await {
                tracing::warn!(container = %id, error = %e, "Background release failed");
            }
        });
    }
}

/// Releases a [`ResourceScope`]
#[derive(Clone)]
pub struct CleanupCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    tasks: TaskController,
}

impl CleanupCoordinator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            tasks: TaskController::new(Arc::clone(&runtime)),
            runtime,
        }
    }

    /// An empty scope bound to this coordinator's runtime
    pub fn scope(&self) -> ResourceScope {
        ResourceScope::new(Arc::clone(&self.runtime))
    }

    /// Release everything in `scope`: task first, then container and snapshot.
    /// Released resources leave the scope, so a second call is a no-op.
    pub async fn release(&self, scope: &mut ResourceScope) -> Result<(), CleanupError> {
        let mut failures = Vec::new();

        if let Some(mut task) = scope.task.take() {
            if let Err(e) = self.release_task(&mut task).await {
                tracing::warn!(container = %task.container_id(), error = %e, "Failed to release task");
                failures.push(e);
            }
        }

        if let Some(container) = scope.container.take() {
            failures.extend(self.release_container(&container).await);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }

    async fn release_task(&self, task: &mut Task) -> Result<()> {
        if task.state() == TaskState::Running {
            if let Err(e) = self.tasks.kill(task, Signal::SIGKILL).await {
                tracing::debug!(container = %task.container_id(), error = %e, "SIGKILL failed (task may be stopped)");
            }
            self.await_exit(task).await;
        }

        match task.state() {
            TaskState::Deleted => Ok(()),
            // exit not confirmed; the runtime refuses the delete if the process lives on
            TaskState::Running => self.runtime.delete_task(task.container_id()).await,
            TaskState::Created | TaskState::Exited(_) => self.tasks.delete(task).await,
        }
    }

    /// Wait for a killed task to report its exit through a fresh subscription
    async fn await_exit(&self, task: &mut Task) {
        let id = task.container_id().to_string();
        let rx = match self.runtime.watch_exit(&id).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::debug!(container = %id, error = %e, "Could not watch exit during cleanup");
                return;
            }
        };

        match timeout(EXIT_WAIT_TIMEOUT, rx).await {
            Ok(Ok(Ok(status))) => task.mark_exited(status.into()),
            Ok(Ok(Err(e))) => {
                tracing::debug!(container = %id, error = %e, "Exit watch failed during cleanup")
            }
            Ok(Err(_)) => tracing::debug!(container = %id, "Exit watch closed during cleanup"),
            Err(_) => tracing::warn!(container = %id, "Timed out waiting for killed task to exit"),
        }
    }

    async fn release_container(&self, container: &Container) -> Vec<AgentError> {
        if let Err(e) = self.runtime.delete_container(&container.id).await {
            tracing::warn!(
                container = %container.id,
                snapshot = %container.snapshot_key,
                error = %e,
                "Failed to delete container, keeping its snapshot"
            );
            return vec![e];
        }
        tracing::debug!(container = %container.id, "Container deleted");

        if let Err(e) = self.runtime.remove_snapshot(&container.snapshot_key).await {
            tracing::warn!(snapshot = %container.snapshot_key, error = %e, "Failed to remove snapshot");
            return vec![e];
        }
        tracing::debug!(snapshot = %container.snapshot_key, "Snapshot removed");
        Vec::new()
    }
}
