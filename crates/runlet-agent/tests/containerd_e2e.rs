//! End-to-end tests against a live containerd daemon
//!
//! These pull real images and create real containers, so they need root and a
//! running containerd. They skip themselves when the socket is missing.
//!
//! # Running
//! ```bash
//! sudo cargo test --package runlet-agent --test containerd_e2e -- --ignored --nocapture
//! ```

use runlet_agent::{
    AgentError, ContainerdConfig, ContainerdRuntime, TerminationCause, WorkloadRunner,
};
use runlet_spec::{PullPolicy, StdioMode, WorkloadSpec};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const E2E_NAMESPACE: &str = "runlet-e2e";
const E2E_STATE_DIR: &str = "/tmp/runlet-containerd-e2e";

/// Exits as soon as its shell reads EOF on stdin
const ALPINE_IMAGE: &str = "docker.io/library/alpine:latest";
/// Serves forever until signalled
const NGINX_IMAGE: &str = "docker.io/library/nginx:alpine";

/// Run an async test body with a timeout
macro_rules! with_timeout {
    ($timeout_secs:expr, $body:expr) => {{
        tokio::time::timeout(std::time::Duration::from_secs($timeout_secs), async move {
            $body
        })
        .await
        .expect(concat!(
            "Test timed out after ",
            stringify!($timeout_secs),
            " seconds"
        ))
    }};
}

macro_rules! skip_without_containerd {
    () => {
        if !Path::new(runlet_agent::containerd_runtime::DEFAULT_SOCKET_PATH).exists() {
            eprintln!("Skipping test: containerd socket not found");
            return;
        }
    };
}

async fn runner() -> WorkloadRunner {
    let runtime = ContainerdRuntime::new(ContainerdConfig {
        namespace: E2E_NAMESPACE.to_string(),
        state_dir: E2E_STATE_DIR.into(),
        ..Default::default()
    })
    .await
    .expect("Failed to connect to containerd");
    WorkloadRunner::new(Arc::new(runtime))
}

fn workload(name: &str, image: &str, deadline: Duration) -> WorkloadSpec {
    let mut spec = WorkloadSpec::new(name, image);
    spec.namespace = E2E_NAMESPACE.to_string();
    spec.deadline = deadline;
    spec.stdio = StdioMode::Null;
    spec.kill_grace = Some(Duration::from_secs(5));
    spec
}

#[tokio::test]
#[ignore = "requires containerd and root"]
async fn test_short_workload_exits_naturally() {
    skip_without_containerd!();

    with_timeout!(300, {
        let outcome = runner()
            .await
            .run(
                &workload("e2e-alpine", ALPINE_IMAGE, Duration::from_secs(30)),
                CancellationToken::new(),
            )
            .await
            .expect("run failed");

        assert_eq!(outcome.cause, TerminationCause::Natural);
        assert_eq!(outcome.exit.code, 0);
        assert!(outcome.cleanup.is_none(), "cleanup: {:?}", outcome.cleanup);
    });
}

#[tokio::test]
#[ignore = "requires containerd and root"]
async fn test_long_workload_stopped_at_deadline() {
    skip_without_containerd!();

    with_timeout!(300, {
        let mut spec = workload("e2e-nginx", NGINX_IMAGE, Duration::from_secs(3));
        spec.sharing.host_resolv_conf = true;

        let outcome = runner()
            .await
            .run(&spec, CancellationToken::new())
            .await
            .expect("run failed");

        assert_ne!(outcome.cause, TerminationCause::Natural);
        assert!(outcome.cleanup.is_none(), "cleanup: {:?}", outcome.cleanup);
    });
}

#[tokio::test]
#[ignore = "requires containerd and root"]
async fn test_cancelled_run_still_cleans_up() {
    skip_without_containerd!();

    with_timeout!(300, {
        let runner = runner().await;
        let spec = workload("e2e-cancel", NGINX_IMAGE, Duration::from_secs(60));

        // lands during pull or run; cleanup must hold either way
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        let err = runner.run(&spec, token).await.unwrap_err();

        assert!(matches!(err.primary, AgentError::Cancelled));
        assert!(err.cleanup.is_none(), "cleanup: {:?}", err.cleanup);
    });
}

#[tokio::test]
#[ignore = "requires containerd and root"]
async fn test_missing_local_image_with_never_policy() {
    skip_without_containerd!();

    with_timeout!(60, {
        let mut spec = workload(
            "e2e-missing",
            "registry.invalid/runlet/does-not-exist:latest",
            Duration::from_secs(5),
        );
        spec.image.pull_policy = PullPolicy::Never;

        let err = runner()
            .await
            .run(&spec, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.primary, AgentError::ImageFetch { .. }));
        assert!(err.cleanup.is_none());
    });
}
