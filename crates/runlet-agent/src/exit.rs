//! Exit observation
//!
//! An [`ExitFuture`] resolves exactly once with a task's exit result. It must be
//! obtained while the task is still `created`: a process that exits before
//! anyone listens would otherwise go unobserved.

use crate::error::{AgentError, Result};
use crate::runtime::{ContainerRuntime, ExitReceiver, ExitStatus};
use crate::task::{Task, TaskState};
use nix::sys::signal::Signal;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::SystemTime;

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    pub code: i32,
    pub exited_at: SystemTime,
}

impl ExitResult {
    /// The signal that ended the process, for shell-style `128 + n` codes
    pub fn signal(&self) -> Option<Signal> {
        if self.code > 128 {
            Signal::try_from(self.code - 128).ok()
        } else {
            None
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

impl From<ExitStatus> for ExitResult {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: i32::try_from(status.code).unwrap_or(i32::MAX),
            exited_at: status.exited_at,
        }
    }
}

/// Single-fire handle on a task's exit
#[derive(Debug)]
pub struct ExitFuture {
    id: String,
    rx: Option<ExitReceiver>,
}

impl ExitFuture {
    pub(crate) fn new(id: impl Into<String>, rx: ExitReceiver) -> Self {
        Self {
            id: id.into(),
            rx: Some(rx),
        }
    }

    /// Container id of the watched task
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the result has already been taken
    pub fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }
}

impl Future for ExitFuture {
    type Output = Result<ExitResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(AgentError::Watch {
                id: this.id.clone(),
                reason: "exit result already consumed".to_string(),
            }));
        };

        let delivered = ready!(Pin::new(rx).poll(cx));
        this.rx = None;

        Poll::Ready(match delivered {
            Ok(Ok(status)) => Ok(status.into()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Watch {
                id: this.id.clone(),
                reason: "runtime connection closed before exit was reported".to_string(),
            }),
        })
    }
}

/// Registers exit subscriptions with the runtime
#[derive(Clone)]
pub struct ExitWatcher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExitWatcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Subscribe to `task`'s exit. Only valid once, while the task is `created`.
    pub async fn register(&self, task: &mut Task) -> Result<ExitFuture> {
        if task.state() != TaskState::Created {
            return Err(AgentError::InvalidState {
                id: task.container_id().to_string(),
                operation: "watch",
                state: task.state().to_string(),
            });
        }
        if task.is_exit_registered() {
            return Err(AgentError::InvalidState {
                id: task.container_id().to_string(),
                operation: "watch",
                state: "created (already watched)".to_string(),
            });
        }

        let rx = self.runtime.watch_exit(task.container_id()).await?;
        task.mark_exit_registered();
        tracing::debug!(container = %task.container_id(), "Exit watcher registered");

        Ok(ExitFuture::new(task.container_id(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn status(code: u32) -> ExitStatus {
        ExitStatus {
            code,
            exited_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_signal_from_exit_code() {
        let result = ExitResult::from(status(143));
        assert_eq!(result.signal(), Some(Signal::SIGTERM));
        assert!(!result.success());

        let result = ExitResult::from(status(0));
        assert_eq!(result.signal(), None);
        assert!(result.success());

        assert_eq!(ExitResult::from(status(1)).signal(), None);
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let (tx, rx) = oneshot::channel();
        let mut exit = ExitFuture::new("app-1", rx);
        tx.send(Ok(status(7))).unwrap();

        let first = (&mut exit).await.unwrap();
        assert_eq!(first.code, 7);
        assert!(exit.is_terminated());

        let second = (&mut exit).await;
        assert!(matches!(second, Err(AgentError::Watch { .. })));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_watch_error() {
        let (tx, rx) = oneshot::channel::<Result<ExitStatus>>();
        drop(tx);
        let err = ExitFuture::new("app-1", rx).await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[tokio::test]
    async fn test_runtime_error_passes_through() {
        let (tx, rx) = oneshot::channel();
        tx.send(Err(AgentError::Watch {
            id: "app-1".to_string(),
            reason: "stream reset".to_string(),
        }))
        .unwrap();
        let err = ExitFuture::new("app-1", rx).await.unwrap_err();
        assert!(err.to_string().contains("stream reset"));
    }
}
