//! runlet CLI
//!
//! Runs one container workload to completion: pull, create, start, stop at
//! the deadline, clean up. The process exits with the workload's exit code.

mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runlet_agent::{create_runtime, CleanupError, WorkloadRunner};
use runlet_observability::{init_logging, FileLoggingConfig, LogFormat, LogLevel, LoggingConfig};

use crate::cli::{Cli, Commands, RunArgs};
use crate::config::{build_runtime_config, build_workload};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs share stderr with the workload's own error output
    let format = if std::io::stderr().is_terminal() {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    };

    let logging = LoggingConfig {
        level: LogLevel::from_verbosity(cli.verbose),
        format,
        file: cli.log_dir.as_ref().map(FileLoggingConfig::new),
        ..Default::default()
    };

    // Hold the guard so file logs flush on exit
    let _guard = init_logging(&logging).context("Failed to initialize logging")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Run(args) => run_workload(&cli, args).await,
        Commands::Validate { spec_path } => validate(spec_path).map(|()| ExitCode::SUCCESS),
    }
}

async fn run_workload(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let spec = build_workload(args)?;
    let runtime = create_runtime(build_runtime_config(cli, &spec.namespace))
        .await
        .context("Failed to initialize container runtime")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping workload");
            on_interrupt.cancel();
        }
    });

    match WorkloadRunner::new(runtime).run(&spec, cancel).await {
        Ok(outcome) => {
            info!(
                container = %outcome.container_id,
                exit_code = outcome.exit.code,
                cause = %outcome.cause,
                "Workload finished"
            );
            if let Some(cleanup) = &outcome.cleanup {
                report_cleanup(cleanup);
            }
            Ok(ExitCode::from(
                u8::try_from(outcome.exit.code).unwrap_or(u8::MAX),
            ))
        }
        Err(e) => {
            let stage = e.primary.stage();
            let err = anyhow::Error::new(e.primary)
                .context(format!("Workload '{}' failed during {}", spec.name, stage));
            eprintln!("Error: {:#}", err);
            if let Some(cleanup) = &e.cleanup {
                report_cleanup(cleanup);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Cleanup problems never replace the run's result; they are printed after it
fn report_cleanup(cleanup: &CleanupError) {
    eprintln!(
        "warning: {} resource(s) could not be released",
        cleanup.failures.len()
    );
    for failure in &cleanup.failures {
        eprintln!("  - {} ({})", failure, failure.stage());
    }
}

fn validate(spec_path: &Path) -> Result<()> {
    info!(path = %spec_path.display(), "Validating workload file");

    match runlet_spec::from_yaml_file(spec_path) {
        Ok(spec) => {
            println!("Workload validation: PASSED");
            println!("  name:      {}", spec.name);
            println!("  image:     {} (pull: {})", spec.image.name, spec.image.pull_policy);
            println!("  namespace: {}", spec.namespace);
            println!(
                "  deadline:  {} then {}",
                humantime::format_duration(spec.deadline),
                spec.stop_signal
            );
            match spec.kill_grace {
                Some(grace) => println!("  escalate:  SIGKILL after {}", humantime::format_duration(grace)),
                None => println!("  escalate:  never"),
            }
            Ok(())
        }
        Err(e) => {
            println!("Workload validation: FAILED");
            Err(e).context(format!("Invalid workload file {}", spec_path.display()))
        }
    }
}
