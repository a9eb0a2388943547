use clap::{Args, Parser, Subcommand, ValueEnum};
use runlet_agent::FailPoint;
use std::path::PathBuf;
use std::time::Duration;

/// Run a single container workload to completion
#[derive(Parser, Debug)]
#[command(name = "runlet")]
#[command(version, about = "Run a single container workload to completion under a deadline")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Container runtime to use
    #[arg(long, default_value = "containerd", value_enum, global = true)]
    pub(crate) runtime: RuntimeType,

    /// containerd socket
    #[arg(
        long,
        env = "RUNLET_SOCKET",
        default_value = runlet_agent::containerd_runtime::DEFAULT_SOCKET_PATH,
        global = true
    )]
    pub(crate) socket: PathBuf,

    /// Snapshotter for container root filesystems
    #[arg(long, default_value = runlet_agent::containerd_runtime::DEFAULT_SNAPSHOTTER, global = true)]
    pub(crate) snapshotter: String,

    /// Directory for task stdio FIFOs
    #[arg(long, default_value = runlet_agent::containerd_runtime::DEFAULT_STATE_DIR, global = true)]
    pub(crate) state_dir: PathBuf,

    /// How long every mock workload runs
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, global = true)]
    pub(crate) mock_run_time: Duration,

    /// Exit code every mock workload reports
    #[arg(long, default_value_t = 0, global = true)]
    pub(crate) mock_exit_code: u32,

    /// Make a mock runtime operation fail (repeatable)
    #[arg(long, value_enum, global = true)]
    pub(crate) mock_fail_at: Vec<MockFailPoint>,

    /// Also write JSON logs to daily-rotated files in this directory
    #[arg(long, global = true)]
    pub(crate) log_dir: Option<PathBuf>,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum RuntimeType {
    /// containerd over its gRPC socket
    Containerd,
    /// In-memory runtime that never touches the host
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum MockFailPoint {
    Pull,
    PrepareSnapshot,
    CreateContainer,
    CreateTask,
    WatchExit,
    StartTask,
    KillTask,
    DeleteTask,
    DeleteContainer,
    RemoveSnapshot,
}

impl From<MockFailPoint> for FailPoint {
    fn from(arg: MockFailPoint) -> Self {
        match arg {
            MockFailPoint::Pull => Self::Pull,
            MockFailPoint::PrepareSnapshot => Self::PrepareSnapshot,
            MockFailPoint::CreateContainer => Self::CreateContainer,
            MockFailPoint::CreateTask => Self::CreateTask,
            MockFailPoint::WatchExit => Self::WatchExit,
            MockFailPoint::StartTask => Self::StartTask,
            MockFailPoint::KillTask => Self::KillTask,
            MockFailPoint::DeleteTask => Self::DeleteTask,
            MockFailPoint::DeleteContainer => Self::DeleteContainer,
            MockFailPoint::RemoveSnapshot => Self::RemoveSnapshot,
        }
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run one workload and exit with its exit code
    Run(RunArgs),

    /// Parse and validate a workload file
    Validate {
        /// Path to the workload YAML
        spec_path: PathBuf,
    },
}

/// Workload settings; flags override values read from `--file`
#[derive(Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Image reference, e.g. docker.io/library/alpine:latest
    pub(crate) image: Option<String>,

    /// Workload YAML to start from
    #[arg(short, long)]
    pub(crate) file: Option<PathBuf>,

    /// Container base name (defaults to the image's repository name)
    #[arg(long)]
    pub(crate) name: Option<String>,

    /// containerd namespace
    #[arg(long)]
    pub(crate) namespace: Option<String>,

    /// Environment override, KEY=VALUE (repeatable)
    #[arg(short, long = "env")]
    pub(crate) env: Vec<String>,

    /// Run time before the stop signal is sent, e.g. 10s
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) deadline: Option<Duration>,

    /// Stop signal sent at the deadline
    #[arg(long)]
    pub(crate) signal: Option<String>,

    /// Wait this long after the stop signal before sending SIGKILL
    #[arg(long, value_parser = humantime::parse_duration, conflicts_with = "no_escalation")]
    pub(crate) kill_grace: Option<Duration>,

    /// Never escalate to SIGKILL
    #[arg(long)]
    pub(crate) no_escalation: bool,

    /// Join the host network namespace
    #[arg(long)]
    pub(crate) host_network: bool,

    /// Bind-mount the host's /etc/hosts
    #[arg(long)]
    pub(crate) host_hosts: bool,

    /// Bind-mount the host's /etc/resolv.conf
    #[arg(long)]
    pub(crate) host_resolv: bool,

    #[arg(long, value_enum)]
    pub(crate) pull_policy: Option<PullPolicyArg>,

    /// What happens to the task's stdout and stderr
    #[arg(long, value_enum)]
    pub(crate) stdio: Option<StdioArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum PullPolicyArg {
    Always,
    IfNotPresent,
    Never,
}

impl From<PullPolicyArg> for runlet_spec::PullPolicy {
    fn from(arg: PullPolicyArg) -> Self {
        match arg {
            PullPolicyArg::Always => Self::Always,
            PullPolicyArg::IfNotPresent => Self::IfNotPresent,
            PullPolicyArg::Never => Self::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum StdioArg {
    Inherit,
    Null,
}

impl From<StdioArg> for runlet_spec::StdioMode {
    fn from(arg: StdioArg) -> Self {
        match arg {
            StdioArg::Inherit => Self::Inherit,
            StdioArg::Null => Self::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "runlet",
            "--runtime",
            "mock",
            "run",
            "alpine:latest",
            "-e",
            "A=1",
            "--env",
            "B=2",
            "--deadline",
            "1m 30s",
            "--pull-policy",
            "if-not-present",
            "--host-network",
        ])
        .unwrap();

        assert_eq!(cli.runtime, RuntimeType::Mock);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.image.as_deref(), Some("alpine:latest"));
        assert_eq!(args.env, vec!["A=1", "B=2"]);
        assert_eq!(args.deadline, Some(Duration::from_secs(90)));
        assert_eq!(args.pull_policy, Some(PullPolicyArg::IfNotPresent));
        assert!(args.host_network);
    }

    #[test]
    fn test_kill_grace_conflicts_with_no_escalation() {
        let result = Cli::try_parse_from([
            "runlet",
            "run",
            "alpine",
            "--kill-grace",
            "5s",
            "--no-escalation",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mock_fail_points_repeat() {
        let cli = Cli::try_parse_from([
            "runlet",
            "--runtime",
            "mock",
            "--mock-fail-at",
            "create-task",
            "--mock-fail-at",
            "delete-container",
            "run",
            "alpine",
        ])
        .unwrap();
        let points: Vec<FailPoint> = cli.mock_fail_at.into_iter().map(Into::into).collect();
        assert_eq!(points, vec![FailPoint::CreateTask, FailPoint::DeleteContainer]);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["runlet", "validate", "w.yaml", "-vv", "--runtime", "mock"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.runtime, RuntimeType::Mock);
    }
}
