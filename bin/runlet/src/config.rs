//! Workload and runtime configuration builders.
//!
//! Converts CLI arguments into the `WorkloadSpec` and `RuntimeConfig` used by
//! the agent.

use anyhow::{bail, Context, Result};
use runlet_agent::{ContainerdConfig, MockConfig, RuntimeConfig};
use runlet_spec::WorkloadSpec;

use crate::cli::{Cli, RunArgs, RuntimeType};

/// Build the workload from `--file` (if given) with flags applied on top
pub(crate) fn build_workload(args: &RunArgs) -> Result<WorkloadSpec> {
    let mut spec = match (&args.file, &args.image) {
        (Some(path), _) => runlet_spec::from_yaml_file(path)
            .with_context(|| format!("Failed to load workload from {}", path.display()))?,
        (None, Some(image)) => WorkloadSpec::new(default_name(image), image.clone()),
        (None, None) => bail!("an image reference or --file is required"),
    };

    if let (Some(_), Some(image)) = (&args.file, &args.image) {
        spec.image.name = image.clone();
    }
    if let Some(name) = &args.name {
        spec.name = name.clone();
    }
    if let Some(namespace) = &args.namespace {
        spec.namespace = namespace.clone();
    }
    spec.env.extend(args.env.iter().cloned());
    if let Some(deadline) = args.deadline {
        spec.deadline = deadline;
    }
    if let Some(signal) = &args.signal {
        spec.stop_signal = signal.clone();
    }
    if args.no_escalation {
        spec.kill_grace = None;
    } else if let Some(grace) = args.kill_grace {
        spec.kill_grace = Some(grace);
    }
    spec.sharing.host_network |= args.host_network;
    spec.sharing.host_hosts_file |= args.host_hosts;
    spec.sharing.host_resolv_conf |= args.host_resolv;
    if let Some(policy) = args.pull_policy {
        spec.image.pull_policy = policy.into();
    }
    if let Some(stdio) = args.stdio {
        spec.stdio = stdio.into();
    }

    runlet_spec::validate_spec(&spec).context("Invalid workload")?;
    Ok(spec)
}

/// Build runtime configuration from CLI arguments; the runtime namespace
/// follows the workload's
pub(crate) fn build_runtime_config(cli: &Cli, namespace: &str) -> RuntimeConfig {
    match cli.runtime {
        RuntimeType::Containerd => RuntimeConfig::Containerd(ContainerdConfig {
            socket_path: cli.socket.clone(),
            namespace: namespace.to_string(),
            snapshotter: cli.snapshotter.clone(),
            state_dir: cli.state_dir.clone(),
            ..Default::default()
        }),
        RuntimeType::Mock => RuntimeConfig::Mock(MockConfig {
            namespace: namespace.to_string(),
            run_time: cli.mock_run_time,
            exit_code: cli.mock_exit_code,
            fail_at: cli.mock_fail_at.iter().copied().map(Into::into).collect(),
        }),
    }
}

/// Repository name of an image reference: `docker.io/library/alpine:3.19`
/// becomes `alpine`
fn default_name(image: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let repository = without_digest.rsplit('/').next().unwrap_or(without_digest);
    let name = repository.split(':').next().unwrap_or(repository);
    if name.is_empty() {
        "workload".to_string()
    } else {
        name.to_string()
    }
}
