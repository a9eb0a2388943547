//! Workload orchestration
//!
//! [`WorkloadRunner`] drives one workload end to end: resolve the image, build
//! the sandbox, create the container and task, watch the exit, start, enforce
//! the deadline, and release everything on every path out.

use crate::cleanup::{CleanupCoordinator, ResourceScope};
use crate::container::{ClockSeed, ContainerFactory, SeedSource};
use crate::error::{AgentError, CleanupError, Result, RunError};
use crate::exit::{ExitResult, ExitWatcher};
use crate::image::ImageProvider;
use crate::runtime::ContainerRuntime;
use crate::sandbox::SandboxSpecBuilder;
use crate::task::TaskController;
use crate::terminator::{Termination, TerminationCause, Terminator};
use futures_util::FutureExt;
use nix::sys::signal::Signal;
use runlet_spec::WorkloadSpec;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of a completed run
#[derive(Debug)]
pub struct RunOutcome {
    pub container_id: String,
    pub exit: ExitResult,
    pub cause: TerminationCause,
    /// Problems hit while releasing resources after the workload finished
    pub cleanup: Option<CleanupError>,
}

/// Parse a signal name (`SIGTERM`, `TERM`, `term`) or number (`15`)
pub fn parse_signal(value: &str) -> Result<Signal> {
    let value = value.trim();
    let invalid = || AgentError::Configuration(format!("unknown signal '{}'", value));

    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| invalid());
    }

    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|_| invalid())
}

/// Runs single workloads against a container runtime
pub struct WorkloadRunner {
    runtime: Arc<dyn ContainerRuntime>,
    seeds: Arc<dyn SeedSource>,
    sandbox: SandboxSpecBuilder,
    cleanup: CleanupCoordinator,
}

impl WorkloadRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            cleanup: CleanupCoordinator::new(Arc::clone(&runtime)),
            runtime,
            seeds: Arc::new(ClockSeed),
            sandbox: SandboxSpecBuilder::new(),
        }
    }

    /// Replace the seed source used for container names
    pub fn with_seed_source(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Replace the sandbox spec builder
    pub fn with_sandbox_builder(mut self, sandbox: SandboxSpecBuilder) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Run `spec` to completion.
    ///
    /// Cancelling `cancel` ends the run with [`AgentError::Cancelled`] at the
    /// next point where nothing is half-created: waits are interrupted, while
    /// a runtime call that allocates finishes and its result is adopted first.
    /// Cleanup runs on every path, including a panic, which is resumed afterwards.
    pub async fn run(
        &self,
        spec: &WorkloadSpec,
        cancel: CancellationToken,
    ) -> std::result::Result<RunOutcome, RunError> {
        let fail = |primary| RunError {
            primary,
            cleanup: None,
        };

        if spec.namespace != self.runtime.namespace() {
            return Err(fail(AgentError::Configuration(format!(
                "workload namespace '{}' does not match runtime namespace '{}'",
                spec.namespace,
                self.runtime.namespace()
            ))));
        }
        let signal = parse_signal(&spec.stop_signal).map_err(fail)?;

        tracing::info!(
            workload = %spec.name,
            image = %spec.image.name,
            runtime = self.runtime.name(),
            namespace = %spec.namespace,
            deadline = ?spec.deadline,
            "Running workload"
        );

        let mut scope = self.cleanup.scope();
        let result = AssertUnwindSafe(self.forward(spec, signal, &cancel, &mut scope))
            .catch_unwind()
            .await;
        if let Ok(Err(AgentError::Cancelled)) = &result {
            tracing::warn!(workload = %spec.name, "Run cancelled");
        }

        let cleanup = self.cleanup.release(&mut scope).await.err();
        if let Some(e) = &cleanup {
            tracing::warn!(error = %e, "Cleanup finished with failures");
        }

        match result {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Ok((container_id, termination))) => Ok(RunOutcome {
                container_id,
                exit: termination.exit,
                cause: termination.cause,
                cleanup,
            }),
            Ok(Err(AgentError::Cancelled)) => Err(RunError {
                primary: AgentError::Cancelled,
                cleanup,
            }),
            Ok(Err(primary)) => {
                tracing::error!(stage = primary.stage(), error = %primary, "Run failed");
                Err(RunError { primary, cleanup })
            }
        }
    }

    async fn forward(
        &self,
        spec: &WorkloadSpec,
        signal: Signal,
        cancel: &CancellationToken,
        scope: &mut ResourceScope,
    ) -> Result<(String, Termination)> {
        let provider = ImageProvider::new(Arc::clone(&self.runtime));
        let image = cancellable(
            cancel,
            provider.resolve(&spec.image.name, spec.image.pull_policy),
        )
        .await?;

        let sandbox = self.sandbox.build(&image, &spec.env_pairs(), spec.sharing)?;
        checkpoint(cancel)?;

        // Not raced: a snapshot it prepared is either bound to the returned
        // container or rolled back before it returns.
        let container = ContainerFactory::new(Arc::clone(&self.runtime))
            .with_seed_source(Arc::clone(&self.seeds))
            .create(&spec.name, &image, sandbox)
            .await?;
        let container_id = container.id.clone();
        let container = scope.adopt_container(container).clone();

        let tasks = TaskController::new(Arc::clone(&self.runtime)).with_stdio(spec.stdio);
        let watcher = ExitWatcher::new(Arc::clone(&self.runtime));
        let terminator = Terminator::new(tasks.clone(), signal).with_kill_grace(spec.kill_grace);

        let span = tracing::info_span!(
            "workload",
            container.id = %container_id,
            container.image.name = %image.name,
        );

        async {
            checkpoint(cancel)?;
            let task = tasks.create_task(&container).await?;
            let task = scope.adopt_task(task);
            checkpoint(cancel)?;

            let exit = cancellable(cancel, watcher.register(task)).await?;
            tasks.start(task).await?;
            checkpoint(cancel)?;

            let termination =
                cancellable(cancel, terminator.enforce(task, spec.deadline, exit)).await?;
            Ok((container_id.clone(), termination))
        }
        .instrument(span)
        .await
    }
}

/// Race a step that allocates nothing outside the scope against cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = step => result,
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AgentError::Cancelled)
    } else {
        Ok(())
    }
}
