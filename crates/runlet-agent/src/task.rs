//! Task lifecycle
//!
//! A [`Task`] is the monitored process inside a container. It moves strictly
//! through `created -> running -> exited -> deleted`; a task that is never
//! started may go straight from `created` to `deleted`.

use crate::container::Container;
use crate::error::{AgentError, Result};
use crate::exit::ExitResult;
use crate::runtime::ContainerRuntime;
use nix::sys::signal::Signal;
use runlet_spec::StdioMode;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

/// Observed task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Exited(ExitResult),
    Deleted,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Running => write!(f, "running"),
            TaskState::Exited(exit) => write!(f, "exited({})", exit.code),
            TaskState::Deleted => write!(f, "deleted"),
        }
    }
}

/// The workload process of one container
#[derive(Debug)]
pub struct Task {
    container_id: String,
    pid: u32,
    state: TaskState,
    exit_registered: bool,
}

impl Task {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_exit_registered(&self) -> bool {
        self.exit_registered
    }

    /// Whether the process may still be holding runtime resources
    pub fn is_live(&self) -> bool {
        matches!(self.state, TaskState::Created | TaskState::Running)
    }

    pub(crate) fn mark_exit_registered(&mut self) {
        self.exit_registered = true;
    }

    pub(crate) fn mark_exited(&mut self, exit: ExitResult) {
        if self.state == TaskState::Running {
            self.state = TaskState::Exited(exit);
        }
    }

    fn invalid(&self, operation: &'static str) -> AgentError {
        AgentError::InvalidState {
            id: self.container_id.clone(),
            operation,
            state: self.state.to_string(),
        }
    }
}

/// Drives task operations against a runtime
#[derive(Clone)]
pub struct TaskController {
    runtime: Arc<dyn ContainerRuntime>,
    stdio: StdioMode,
}

impl TaskController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            stdio: StdioMode::default(),
        }
    }

    /// How the task's stdout/stderr are bound
    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    /// Create the container's task without starting it
    pub async fn create_task(&self, container: &Container) -> Result<Task> {
        let pid = self
            .runtime
            .create_task(&container.id, self.stdio)
            .await?;
        tracing::debug!(container = %container.id, pid, stdio = %self.stdio, "Task created");

        Ok(Task {
            container_id: container.id.clone(),
            pid,
            state: TaskState::Created,
            exit_registered: false,
        })
    }

    /// Start a created task. Its exit must already be watched.
    pub async fn start(&self, task: &mut Task) -> Result<()> {
        if task.state != TaskState::Created {
            return Err(task.invalid("start"));
        }
        if !task.exit_registered {
            return Err(AgentError::ExitNotWatched {
                id: task.container_id.clone(),
            });
        }

        let span = tracing::info_span!("task.start", container.id = %task.container_id, pid = task.pid);
        self.runtime
            .start_task(&task.container_id)
            .instrument(span)
            .await?;
        task.state = TaskState::Running;
        tracing::info!(container = %task.container_id, pid = task.pid, "Task started");
        Ok(())
    }

    /// Signal a running task. Does not wait for it to exit.
    pub async fn kill(&self, task: &Task, signal: Signal) -> Result<()> {
        if task.state != TaskState::Running {
            return Err(task.invalid("kill"));
        }
        tracing::info!(container = %task.container_id, signal = %signal, "Signalling task");
        self.runtime.kill_task(&task.container_id, signal).await
    }

    /// Release a task that has exited or never started
    pub async fn delete(&self, task: &mut Task) -> Result<()> {
        match task.state {
            TaskState::Running => {
                return Err(AgentError::TaskDelete {
                    id: task.container_id.clone(),
                    reason: "task is still running".to_string(),
                })
            }
            TaskState::Deleted => return Err(task.invalid("delete")),
            TaskState::Created | TaskState::Exited(_) => {}
        }

        self.runtime.delete_task(&task.container_id).await?;
        task.state = TaskState::Deleted;
        tracing::debug!(container = %task.container_id, "Task deleted");
        Ok(())
    }
}
