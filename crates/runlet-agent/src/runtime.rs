//! Abstract container runtime interface
//!
//! Defines the [`ContainerRuntime`] trait the lifecycle components drive, and an
//! in-memory [`MockRuntime`] for tests and dry runs.

use crate::error::{AgentError, Result};
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;
use runlet_spec::StdioMode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Image content as stored by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContent {
    /// Reference the image is stored under
    pub name: String,
    /// Digest of the image's target manifest
    pub digest: String,
    /// Raw OCI image config blob
    pub config: Vec<u8>,
}

/// Everything the runtime needs to register a container
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub id: String,
    pub image: String,
    pub snapshot_key: String,
    pub spec: Spec,
    pub labels: HashMap<String, String>,
}

/// Exit status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    pub exited_at: SystemTime,
}

/// One-shot delivery of a task's exit status
pub type ExitReceiver = oneshot::Receiver<Result<ExitStatus>>;

/// Abstract container runtime trait
///
/// Operations are keyed by container id; a container has at most one task.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &'static str;

    /// Namespace all resources are grouped under
    fn namespace(&self) -> &str;

    /// Look up an image already present in local storage
    async fn lookup_image(&self, reference: &str) -> Result<Option<ImageContent>>;

    /// Pull an image into local storage, unpacking it for the snapshotter when asked
    async fn pull_image(&self, reference: &str, unpack: bool) -> Result<ImageContent>;

    /// Prepare a writable snapshot on top of `parent` (an image chain ID)
    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<()>;

    /// Remove a snapshot
    async fn remove_snapshot(&self, key: &str) -> Result<()>;

    /// Register a container bound to an existing snapshot
    async fn create_container(&self, request: &ContainerRequest) -> Result<()>;

    /// Delete a container record
    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Read a file from a prepared snapshot's root filesystem. `Ok(None)` when
    /// the file does not exist.
    async fn read_rootfs_file(&self, snapshot_key: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create the container's task without starting it; returns its pid
    async fn create_task(&self, id: &str, stdio: StdioMode) -> Result<u32>;

    /// Subscribe to the task's exit. The receiver resolves with the first exit
    /// status the runtime reports for the task, including one it still holds
    /// from an exit that happened before the subscription reached it. The
    /// underlying request may still be in flight when this returns.
    async fn watch_exit(&self, id: &str) -> Result<ExitReceiver>;

    /// Start a created task
    async fn start_task(&self, id: &str) -> Result<()>;

    /// Send a signal to the task's process
    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()>;

    /// Delete a stopped (or never started) task
    async fn delete_task(&self, id: &str) -> Result<()>;
}

// =============================================================================
// Mock runtime
// =============================================================================

/// Behaviour of a workload image in the [`MockRuntime`]
#[derive(Debug, Clone)]
pub struct MockWorkload {
    /// How long the process runs before exiting on its own
    pub run_time: Duration,
    /// Exit code on natural exit
    pub exit_code: u32,
    /// Signals the process ignores (SIGKILL is never ignored)
    pub ignored_signals: Vec<Signal>,
    /// OCI image config served for this image
    pub config: serde_json::Value,
}

impl MockWorkload {
    pub fn new(run_time: Duration, exit_code: u32) -> Self {
        Self {
            run_time,
            exit_code,
            ignored_signals: Vec::new(),
            config: serde_json::json!({
                "architecture": "amd64",
                "os": "linux",
                "config": {
                    "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
                    "Cmd": ["/bin/sh"],
                    "WorkingDir": "/"
                },
                "rootfs": {
                    "type": "layers",
                    "diff_ids": [
                        "sha256:0a9a5dfd008f05ebc27e4790db0709a29e527690c21bcbcd01481eaeb6bb49dc"
                    ]
                }
            }),
        }
    }

    /// Serve a custom image config
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Make the process ignore a signal
    pub fn ignoring(mut self, signal: Signal) -> Self {
        self.ignored_signals.push(signal);
        self
    }
}

/// Runtime operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Pull,
    PrepareSnapshot,
    CreateContainer,
    CreateTask,
    WatchExit,
    /// The exit subscription is accepted but the connection drops before delivery
    DropExit,
    StartTask,
    KillTask,
    DeleteTask,
    DeleteContainer,
    RemoveSnapshot,
}

/// Operations observed by the [`MockRuntime`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Pull(String),
    PrepareSnapshot { key: String, parent: String },
    RemoveSnapshot(String),
    CreateContainer(String),
    DeleteContainer(String),
    CreateTask(String),
    WatchExit(String),
    StartTask(String),
    KillTask(String, Signal),
    TaskExited(String, u32),
    DeleteTask(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockTaskState {
    Created,
    Running,
    Stopped(ExitStatus),
}

struct MockTask {
    state: MockTaskState,
    watchers: Vec<oneshot::Sender<Result<ExitStatus>>>,
    workload: MockWorkload,
    runner: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct MockState {
    images: HashMap<String, ImageContent>,
    snapshots: HashSet<String>,
    containers: HashMap<String, ContainerRequest>,
    tasks: HashMap<String, MockTask>,
    events: Vec<RuntimeEvent>,
    violations: Vec<String>,
}

impl MockState {
    fn complete(&mut self, id: &str, code: u32) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        if matches!(task.state, MockTaskState::Stopped(_)) {
            return;
        }
        let status = ExitStatus {
            code,
            exited_at: SystemTime::now(),
        };
        task.state = MockTaskState::Stopped(status);
        if let Some(runner) = task.runner.take() {
            runner.abort();
        }
        for watcher in task.watchers.drain(..) {
            let _ = watcher.send(Ok(status));
        }
        self.events
            .push(RuntimeEvent::TaskExited(id.to_string(), code));
    }
}

/// In-memory mock runtime for testing and development
///
/// Tasks "run" for their workload's `run_time` on the tokio clock, so tests can
/// drive deadlines with a paused clock.
pub struct MockRuntime {
    namespace: String,
    registry: HashMap<String, MockWorkload>,
    default_workload: Option<MockWorkload>,
    failures: HashSet<FailPoint>,
    rootfs_files: HashMap<String, Vec<u8>>,
    strict: bool,
    next_pid: AtomicU32,
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    /// Empty registry: every pull fails until images are registered
    pub fn new() -> Self {
        Self {
            namespace: runlet_spec::DEFAULT_NAMESPACE.to_string(),
            registry: HashMap::new(),
            default_workload: None,
            failures: HashSet::new(),
            rootfs_files: HashMap::new(),
            strict: false,
            next_pid: AtomicU32::new(1000),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Register an image in the mock registry
    pub fn with_image(mut self, reference: impl Into<String>, workload: MockWorkload) -> Self {
        self.registry.insert(reference.into(), workload);
        self
    }

    /// Resolve every unregistered reference to this workload
    pub fn with_default_workload(mut self, workload: MockWorkload) -> Self {
        self.default_workload = Some(workload);
        self
    }

    /// Make an operation fail
    pub fn failing_at(mut self, point: FailPoint) -> Self {
        self.failures.insert(point);
        self
    }

    /// Serve a file from every prepared snapshot's root filesystem
    pub fn with_rootfs_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.rootfs_files.insert(path.into(), contents.into());
        self
    }

    /// Reject task starts that have no exit watcher registered
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Seed local storage so lookups succeed without a pull
    pub async fn preload(&self, reference: &str) -> Result<()> {
        let content = self.content_for(reference)?;
        let mut state = self.state.lock().await;
        state.images.insert(reference.to_string(), content);
        Ok(())
    }

    /// Every operation observed so far
    pub async fn events(&self) -> Vec<RuntimeEvent> {
        self.state.lock().await.events.clone()
    }

    /// Number of signals delivered to any task
    pub async fn kill_count(&self) -> usize {
        self.state
            .lock()
            .await
            .events
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::KillTask(..)))
            .count()
    }

    /// Starts that happened with no exit watcher registered
    pub async fn ordering_violations(&self) -> Vec<String> {
        self.state.lock().await.violations.clone()
    }

    pub async fn live_containers(&self) -> Vec<String> {
        self.state.lock().await.containers.keys().cloned().collect()
    }

    /// OCI spec a live container was created with
    pub async fn container_spec(&self, id: &str) -> Option<Spec> {
        self.state
            .lock()
            .await
            .containers
            .get(id)
            .map(|c| c.spec.clone())
    }

    pub async fn live_snapshots(&self) -> Vec<String> {
        self.state.lock().await.snapshots.iter().cloned().collect()
    }

    pub async fn live_tasks(&self) -> Vec<String> {
        self.state.lock().await.tasks.keys().cloned().collect()
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.failures.contains(&point)
    }

    fn workload_for(&self, reference: &str) -> Option<&MockWorkload> {
        self.registry
            .get(reference)
            .or(self.default_workload.as_ref())
    }

    fn content_for(&self, reference: &str) -> Result<ImageContent> {
        let workload = self
            .workload_for(reference)
            .ok_or_else(|| AgentError::ImageFetch {
                image: reference.to_string(),
                reason: "not found in registry".to_string(),
            })?;
        let config = serde_json::to_vec(&workload.config)
            .map_err(|e| AgentError::Internal(format!("failed to encode mock config: {}", e)))?;
        Ok(ImageContent {
            name: reference.to_string(),
            digest: format!("sha256:{:064x}", reference.len()),
            config,
        })
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn lookup_image(&self, reference: &str) -> Result<Option<ImageContent>> {
        let state = self.state.lock().await;
        Ok(state.images.get(reference).cloned())
    }

    async fn pull_image(&self, reference: &str, _unpack: bool) -> Result<ImageContent> {
        let mut state = self.state.lock().await;
        state.events.push(RuntimeEvent::Pull(reference.to_string()));
        if self.fails(FailPoint::Pull) {
            return Err(AgentError::ImageFetch {
                image: reference.to_string(),
                reason: "registry unreachable".to_string(),
            });
        }
        let content = self.content_for(reference)?;
        state.images.insert(reference.to_string(), content.clone());
        Ok(content)
    }

    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.fails(FailPoint::PrepareSnapshot) {
            return Err(AgentError::ContainerCreate {
                id: key.to_string(),
                reason: "snapshotter refused prepare".to_string(),
            });
        }
        if !state.snapshots.insert(key.to_string()) {
            return Err(AgentError::ContainerCreate {
                id: key.to_string(),
                reason: "snapshot already exists".to_string(),
            });
        }
        state.events.push(RuntimeEvent::PrepareSnapshot {
            key: key.to_string(),
            parent: parent.to_string(),
        });
        Ok(())
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.fails(FailPoint::RemoveSnapshot) {
            return Err(AgentError::ContainerDelete {
                id: key.to_string(),
                reason: "snapshotter refused remove".to_string(),
            });
        }
        if !state.snapshots.remove(key) {
            return Err(AgentError::ContainerDelete {
                id: key.to_string(),
                reason: "snapshot not found".to_string(),
            });
        }
        state.events.push(RuntimeEvent::RemoveSnapshot(key.to_string()));
        Ok(())
    }

    async fn read_rootfs_file(&self, snapshot_key: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        if !state.snapshots.contains(snapshot_key) {
            return Err(AgentError::ContainerCreate {
                id: snapshot_key.to_string(),
                reason: "snapshot not prepared".to_string(),
            });
        }
        Ok(self.rootfs_files.get(path).cloned())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        let fail = |reason: &str| AgentError::ContainerCreate {
            id: request.id.clone(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::CreateContainer) {
            return Err(fail("runtime rejected container"));
        }
        if !state.snapshots.contains(&request.snapshot_key) {
            return Err(fail("snapshot not prepared"));
        }
        if state.containers.contains_key(&request.id) {
            return Err(fail("container already exists"));
        }
        state
            .containers
            .insert(request.id.clone(), request.clone());
        state
            .events
            .push(RuntimeEvent::CreateContainer(request.id.clone()));
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let fail = |reason: &str| AgentError::ContainerDelete {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::DeleteContainer) {
            return Err(fail("runtime refused delete"));
        }
        if state.tasks.contains_key(id) {
            return Err(fail("container still has a task"));
        }
        if state.containers.remove(id).is_none() {
            return Err(fail("container not found"));
        }
        state.events.push(RuntimeEvent::DeleteContainer(id.to_string()));
        Ok(())
    }

    async fn create_task(&self, id: &str, _stdio: StdioMode) -> Result<u32> {
        let mut state = self.state.lock().await;
        let fail = |reason: &str| AgentError::TaskCreate {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::CreateTask) {
            return Err(fail("shim failed to create process"));
        }
        let image = state
            .containers
            .get(id)
            .map(|c| c.image.clone())
            .ok_or_else(|| fail("container not found"))?;
        if state.tasks.contains_key(id) {
            return Err(fail("task already exists"));
        }
        let workload = self
            .workload_for(&image)
            .cloned()
            .ok_or_else(|| fail("image has no workload"))?;
        state.tasks.insert(
            id.to_string(),
            MockTask {
                state: MockTaskState::Created,
                watchers: Vec::new(),
                workload,
                runner: None,
            },
        );
        state.events.push(RuntimeEvent::CreateTask(id.to_string()));
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    async fn watch_exit(&self, id: &str) -> Result<ExitReceiver> {
        let mut state = self.state.lock().await;
        if self.fails(FailPoint::WatchExit) {
            return Err(AgentError::Watch {
                id: id.to_string(),
                reason: "event stream unavailable".to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        let task = state.tasks.get_mut(id).ok_or_else(|| AgentError::Watch {
            id: id.to_string(),
            reason: "task not found".to_string(),
        })?;
        if self.fails(FailPoint::DropExit) {
            drop(tx);
        } else if let MockTaskState::Stopped(status) = task.state {
            let _ = tx.send(Ok(status));
        } else {
            task.watchers.push(tx);
        }
        state.events.push(RuntimeEvent::WatchExit(id.to_string()));
        Ok(rx)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let fail = |reason: &str| AgentError::TaskStart {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::StartTask) {
            return Err(fail("runtime rejected process launch"));
        }
        let watched = state
            .events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::WatchExit(w) if w == id));
        if !watched {
            state
                .violations
                .push(format!("task '{}' started without an exit watcher", id));
            if self.strict {
                return Err(fail("no exit watcher registered"));
            }
        }
        let task = state.tasks.get_mut(id).ok_or_else(|| fail("task not found"))?;
        if task.state != MockTaskState::Created {
            return Err(fail("task is not in created state"));
        }
        task.state = MockTaskState::Running;

        let run_time = task.workload.run_time;
        let exit_code = task.workload.exit_code;
        let shared = Arc::clone(&self.state);
        let task_id = id.to_string();
        task.runner = Some(tokio::spawn(async move {
            tokio::time::sleep(run_time).await;
            shared.lock().await.complete(&task_id, exit_code);
        }));

        state.events.push(RuntimeEvent::StartTask(id.to_string()));
        Ok(())
    }

    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()> {
        let mut state = self.state.lock().await;
        let fail = |reason: &str| AgentError::TaskKill {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::KillTask) {
            return Err(fail("signal delivery failed"));
        }
        let task = state.tasks.get(id).ok_or_else(|| fail("task not found"))?;
        if matches!(task.state, MockTaskState::Stopped(_)) {
            return Err(fail("process already finished"));
        }
        let ignored = signal != Signal::SIGKILL
            && task.state == MockTaskState::Running
            && task.workload.ignored_signals.contains(&signal);
        state
            .events
            .push(RuntimeEvent::KillTask(id.to_string(), signal));
        if !ignored {
            state.complete(id, 128 + signal as u32);
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let fail = |reason: &str| AgentError::TaskDelete {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.fails(FailPoint::DeleteTask) {
            return Err(fail("shim refused delete"));
        }
        let task = state.tasks.get(id).ok_or_else(|| fail("task not found"))?;
        if task.state == MockTaskState::Running {
            return Err(fail("task must be stopped before deletion"));
        }
        state.tasks.remove(id);
        state.events.push(RuntimeEvent::DeleteTask(id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, image: &str) -> ContainerRequest {
        ContainerRequest {
            id: id.to_string(),
            image: image.to_string(),
            snapshot_key: format!("{}-snapshot", id),
            spec: Spec::default(),
            labels: HashMap::new(),
        }
    }

    async fn created(runtime: &MockRuntime, id: &str, image: &str) {
        runtime.pull_image(image, true).await.unwrap();
        runtime
            .prepare_snapshot(&format!("{}-snapshot", id), "sha256:parent")
            .await
            .unwrap();
        runtime.create_container(&request(id, image)).await.unwrap();
        runtime.create_task(id, StdioMode::Null).await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_unknown_image_fails() {
        let runtime = MockRuntime::new();
        let err = runtime.pull_image("nope:latest", true).await.unwrap_err();
        assert!(matches!(err, AgentError::ImageFetch { .. }));
        assert!(runtime.lookup_image("nope:latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_stores_image_locally() {
        let runtime =
            MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_secs(1), 0));
        assert!(runtime.lookup_image("app:1").await.unwrap().is_none());
        runtime.pull_image("app:1", true).await.unwrap();
        let stored = runtime.lookup_image("app:1").await.unwrap().unwrap();
        assert_eq!(stored.name, "app:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_exit_delivered_to_watcher() {
        let runtime =
            MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_secs(1), 3));
        created(&runtime, "c1", "app:1").await;

        let rx = runtime.watch_exit("c1").await.unwrap();
        runtime.start_task("c1").await.unwrap();

        let status = rx.await.unwrap().unwrap();
        assert_eq!(status.code, 3);
        assert!(runtime.ordering_violations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_after_exit_resolves_immediately() {
        let runtime =
            MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_millis(5), 0));
        created(&runtime, "c1", "app:1").await;
        let first = runtime.watch_exit("c1").await.unwrap();
        runtime.start_task("c1").await.unwrap();
        first.await.unwrap().unwrap();

        let late = runtime.watch_exit("c1").await.unwrap();
        assert_eq!(late.await.unwrap().unwrap().code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_rejects_unwatched_start() {
        let runtime = MockRuntime::new()
            .with_image("app:1", MockWorkload::new(Duration::from_secs(1), 0))
            .strict();
        created(&runtime, "c1", "app:1").await;

        let err = runtime.start_task("c1").await.unwrap_err();
        assert!(matches!(err, AgentError::TaskStart { .. }));
        assert_eq!(runtime.ordering_violations().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_reports_signal_exit() {
        let runtime =
            MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_secs(30), 0));
        created(&runtime, "c1", "app:1").await;
        let rx = runtime.watch_exit("c1").await.unwrap();
        runtime.start_task("c1").await.unwrap();

        runtime.kill_task("c1", Signal::SIGTERM).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap().code, 143);

        let err = runtime.kill_task("c1", Signal::SIGTERM).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskKill { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_signal_keeps_running() {
        let runtime = MockRuntime::new().with_image(
            "app:1",
            MockWorkload::new(Duration::from_secs(30), 0).ignoring(Signal::SIGTERM),
        );
        created(&runtime, "c1", "app:1").await;
        let _rx = runtime.watch_exit("c1").await.unwrap();
        runtime.start_task("c1").await.unwrap();
        runtime.kill_task("c1", Signal::SIGTERM).await.unwrap();

        let err = runtime.delete_task("c1").await.unwrap_err();
        assert!(matches!(err, AgentError::TaskDelete { .. }));

        runtime.kill_task("c1", Signal::SIGKILL).await.unwrap();
        runtime.delete_task("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_container_delete_requires_task_gone() {
        let runtime =
            MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_secs(1), 0));
        created(&runtime, "c1", "app:1").await;

        assert!(runtime.delete_container("c1").await.is_err());
        runtime.delete_task("c1").await.unwrap();
        runtime.delete_container("c1").await.unwrap();
        runtime.remove_snapshot("c1-snapshot").await.unwrap();

        assert!(runtime.live_containers().await.is_empty());
        assert!(runtime.live_snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_exit_closes_channel() {
        let runtime = MockRuntime::new()
            .with_image("app:1", MockWorkload::new(Duration::from_secs(1), 0))
            .failing_at(FailPoint::DropExit);
        created(&runtime, "c1", "app:1").await;

        let rx = runtime.watch_exit("c1").await.unwrap();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_rootfs_file_needs_prepared_snapshot() {
        let runtime = MockRuntime::new().with_rootfs_file("/etc/passwd", "root:x:0:0::/root:/bin/sh\n");
        assert!(runtime.read_rootfs_file("app-snapshot", "/etc/passwd").await.is_err());

        runtime.prepare_snapshot("app-snapshot", "sha256:parent").await.unwrap();
        let passwd = runtime
            .read_rootfs_file("app-snapshot", "/etc/passwd")
            .await
            .unwrap()
            .unwrap();
        assert!(passwd.starts_with(b"root:"));
        assert_eq!(
            runtime.read_rootfs_file("app-snapshot", "/etc/group").await.unwrap(),
            None
        );
    }
}
