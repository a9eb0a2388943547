//! Deadline enforcement
//!
//! Races the run-time budget against the task's exit. When the budget runs
//! out first the task is signalled, and the same exit future is then awaited,
//! so both paths end with one exit result.

use crate::error::{AgentError, Result};
use crate::exit::{ExitFuture, ExitResult};
use crate::task::{Task, TaskController};
use nix::sys::signal::Signal;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};

/// How long a failed signal delivery waits to see if the process already exited
const KILL_RACE_WINDOW: Duration = Duration::from_millis(500);

/// Why the task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Exited on its own within the deadline
    Natural,
    /// Stopped by the configured signal after the deadline
    Deadline,
    /// Survived the configured signal and was SIGKILLed
    Escalated,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Natural => write!(f, "natural"),
            TerminationCause::Deadline => write!(f, "deadline"),
            TerminationCause::Escalated => write!(f, "escalated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub exit: ExitResult,
    pub cause: TerminationCause,
}

/// Enforces a deadline on a running task
#[derive(Clone)]
pub struct Terminator {
    controller: TaskController,
    signal: Signal,
    kill_grace: Option<Duration>,
}

impl Terminator {
    pub fn new(controller: TaskController, signal: Signal) -> Self {
        Self {
            controller,
            signal,
            kill_grace: None,
        }
    }

    /// Grace period before escalating to SIGKILL; `None` never escalates
    pub fn with_kill_grace(mut self, kill_grace: Option<Duration>) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Wait for `task` to exit, signalling it once `deadline` has elapsed.
    /// The deadline is measured from the call, which should directly follow start.
    pub async fn enforce(
        &self,
        task: &mut Task,
        deadline: Duration,
        mut exit: ExitFuture,
    ) -> Result<Termination> {
        let expires = Instant::now() + deadline;

        tokio::select! {
            result = &mut exit => {
                let exit = result?;
                task.mark_exited(exit);
                tracing::info!(
                    container = %task.container_id(),
                    code = exit.code,
                    "Task exited before deadline"
                );
                return Ok(Termination { exit, cause: TerminationCause::Natural });
            }
            _ = sleep_until(expires) => {}
        }

        tracing::warn!(
            container = %task.container_id(),
            deadline = ?deadline,
            signal = %self.signal,
            "Deadline reached, stopping task"
        );

        if let Some(exit) = self.signal_or_exited(task, self.signal, &mut exit).await? {
            return Ok(self.finish(task, exit, TerminationCause::Natural));
        }

        let Some(grace) = self.kill_grace.filter(|_| self.signal != Signal::SIGKILL) else {
            let exit = exit.await?;
            return Ok(self.finish(task, exit, TerminationCause::Deadline));
        };

        match timeout(grace, &mut exit).await {
            Ok(result) => Ok(self.finish(task, result?, TerminationCause::Deadline)),
            Err(_) => {
                tracing::warn!(
                    container = %task.container_id(),
                    grace = ?grace,
                    "Task ignored stop signal, escalating to SIGKILL"
                );
                let exit = match self
                    .signal_or_exited(task, Signal::SIGKILL, &mut exit)
                    .await?
                {
                    Some(exit) => exit,
                    None => exit.await?,
                };
                Ok(self.finish(task, exit, TerminationCause::Escalated))
            }
        }
    }

    /// Deliver `signal`. If delivery fails because the process has just exited,
    /// return that exit instead of the error.
    async fn signal_or_exited(
        &self,
        task: &Task,
        signal: Signal,
        exit: &mut ExitFuture,
    ) -> Result<Option<ExitResult>> {
        let err: AgentError = match self.controller.kill(task, signal).await {
            Ok(()) => return Ok(None),
            Err(e) => e,
        };

        match timeout(KILL_RACE_WINDOW, exit).await {
            Ok(Ok(result)) => {
                tracing::debug!(
                    container = %task.container_id(),
                    error = %err,
                    "Signal raced with exit"
                );
                Ok(Some(result))
            }
            _ => Err(err),
        }
    }

    fn finish(&self, task: &mut Task, exit: ExitResult, cause: TerminationCause) -> Termination {
        task.mark_exited(exit);
        tracing::info!(
            container = %task.container_id(),
            code = exit.code,
            cause = %cause,
            "Task stopped"
        );
        Termination { exit, cause }
    }
}
