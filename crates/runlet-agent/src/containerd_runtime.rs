//! Containerd runtime implementation
//!
//! Implements [`ContainerRuntime`] over containerd's gRPC API using
//! containerd-client.

use crate::error::{AgentError, Result};
use crate::runtime::{ContainerRequest, ContainerRuntime, ExitReceiver, ExitStatus, ImageContent};
use containerd_client::services::v1::container::Runtime as ContainerdRuntimeInfo;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetContainerRequest, GetImageRequest, KillRequest, ReadContentRequest,
    StartRequest, TransferRequest, WaitRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform};
use containerd_client::{connect, to_any, with_namespace};
use nix::sys::signal::Signal;
use runlet_spec::StdioMode;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tonic::transport::Channel;
// Required for with_namespace! macro
use tonic::Request;

/// Default containerd socket path
pub const DEFAULT_SOCKET_PATH: &str = "/run/containerd/containerd.sock";

/// Default snapshotter (overlayfs)
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Default runtime name
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// Default directory for per-task stdio FIFOs
pub const DEFAULT_STATE_DIR: &str = "/run/runlet";

/// Type URL containerd expects on a packed OCI runtime spec
const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

/// Configuration for ContainerdRuntime
#[derive(Debug, Clone)]
pub struct ContainerdConfig {
    /// Path to containerd socket
    pub socket_path: PathBuf,
    /// Namespace for containers
    pub namespace: String,
    /// Snapshotter to use
    pub snapshotter: String,
    /// State directory for FIFOs
    pub state_dir: PathBuf,
    /// Runtime name
    pub runtime: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            namespace: runlet_spec::DEFAULT_NAMESPACE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }
}

/// Output forwarding for one task
#[derive(Debug)]
struct TaskIo {
    dir: PathBuf,
    forwarders: Vec<JoinHandle<()>>,
}

impl TaskIo {
    async fn close(self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        let _ = fs::remove_dir_all(&self.dir).await;
    }
}

/// Containerd-based container runtime
#[derive(Debug)]
pub struct ContainerdRuntime {
    /// gRPC channel to containerd
    channel: Channel,
    config: ContainerdConfig,
    /// Snapshot key per container created by this runtime
    snapshots: RwLock<HashMap<String, String>>,
    io: Mutex<HashMap<String, TaskIo>>,
}

impl ContainerdRuntime {
    /// Create a new ContainerdRuntime with the given configuration
    pub async fn new(config: ContainerdConfig) -> Result<Self> {
        fs::create_dir_all(&config.state_dir).await.map_err(|e| {
            AgentError::Configuration(format!(
                "failed to create state directory {}: {}",
                config.state_dir.display(),
                e
            ))
        })?;

        let channel = connect(&config.socket_path).await.map_err(|e| {
            AgentError::Internal(format!(
                "failed to connect to containerd at {}: {}",
                config.socket_path.display(),
                e
            ))
        })?;

        tracing::debug!(
            socket = %config.socket_path.display(),
            namespace = %config.namespace,
            "Connected to containerd"
        );

        Ok(Self {
            channel,
            config,
            snapshots: RwLock::new(HashMap::new()),
            io: Mutex::new(HashMap::new()),
        })
    }

    /// Create a new ContainerdRuntime with default configuration
    pub async fn with_defaults() -> Result<Self> {
        Self::new(ContainerdConfig::default()).await
    }

    fn ns(&self) -> &str {
        self.config.namespace.as_str()
    }

    /// Read a whole content blob
    async fn read_content(&self, image: &str, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel.clone());
        let request = with_namespace!(
            ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
            },
            self.ns()
        );

        let fetch_err = |e: tonic::Status| AgentError::ImageFetch {
            image: image.to_string(),
            reason: format!("failed to read content {}: {}", digest, e),
        };

        let mut stream = client.read(request).await.map_err(fetch_err)?.into_inner();
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(fetch_err)? {
            bytes.extend_from_slice(&chunk.data);
        }
        Ok(bytes)
    }

    /// Read and parse a JSON content blob
    async fn read_json(&self, image: &str, digest: &str) -> Result<serde_json::Value> {
        let bytes = self.read_content(image, digest).await?;
        serde_json::from_slice(&bytes).map_err(|e| AgentError::ImageFormat {
            image: image.to_string(),
            reason: format!("failed to parse {}: {}", digest, e),
        })
    }

    /// Follow the image target (an index or a manifest) to its config blob
    async fn image_config(&self, image: &str, target_digest: &str) -> Result<Vec<u8>> {
        let format_err = |reason: &str| AgentError::ImageFormat {
            image: image.to_string(),
            reason: reason.to_string(),
        };

        let mut manifest = self.read_json(image, target_digest).await?;
        if manifest["manifests"].is_array() {
            let digest = select_platform_manifest(&manifest, oci_arch())
                .ok_or_else(|| format_err("index has no manifest for this platform"))?;
            manifest = self.read_json(image, &digest).await?;
        }

        let config_digest = manifest["config"]["digest"]
            .as_str()
            .ok_or_else(|| format_err("manifest has no config digest"))?
            .to_string();

        self.read_content(image, &config_digest).await
    }

    async fn snapshot_key(&self, id: &str) -> Result<String> {
        if let Some(key) = self.snapshots.read().await.get(id) {
            return Ok(key.clone());
        }

        let mut client = ContainersClient::new(self.channel.clone());
        let request = with_namespace!(GetContainerRequest { id: id.to_string() }, self.ns());
        let container = client
            .get(request)
            .await
            .map_err(|e| AgentError::TaskCreate {
                id: id.to_string(),
                reason: format!("failed to get container: {}", e),
            })?
            .into_inner()
            .container
            .ok_or_else(|| AgentError::TaskCreate {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;
        Ok(container.snapshot_key)
    }

    /// Get mounts for a snapshot
    async fn snapshot_mounts(&self, snapshot_key: &str) -> Result<Vec<Mount>, tonic::Status> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = with_namespace!(
            MountsRequest {
                snapshotter: self.config.snapshotter.clone(),
                key: snapshot_key.to_string(),
            },
            self.ns()
        );

        Ok(client.mounts(request).await?.into_inner().mounts)
    }

    /// Create stdout/stderr FIFOs and start forwarding them to ours
    async fn open_io(&self, id: &str) -> Result<TaskIo> {
        let dir = self.config.state_dir.join(id);
        let io_err = |reason: String| AgentError::TaskCreate {
            id: id.to_string(),
            reason,
        };

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(format!("failed to create task state directory: {}", e)))?;

        let mut io = TaskIo {
            dir: dir.clone(),
            forwarders: Vec::new(),
        };
        for (name, to_stderr) in [("stdout", false), ("stderr", true)] {
            let path = dir.join(name);
            let _ = fs::remove_file(&path).await;
            if let Err(e) = make_fifo(&path) {
                io.close().await;
                return Err(io_err(format!(
                    "failed to create FIFO {}: {}",
                    path.display(),
                    e
                )));
            }
            match forward_fifo(&path, to_stderr) {
                Ok(handle) => io.forwarders.push(handle),
                Err(e) => {
                    io.close().await;
                    return Err(io_err(format!("failed to open FIFO {}: {}", path.display(), e)));
                }
            }
        }
        Ok(io)
    }
}

fn make_fifo(path: &Path) -> nix::Result<()> {
    nix::unistd::mkfifo(
        path,
        nix::sys::stat::Mode::from_bits(0o600).unwrap_or(nix::sys::stat::Mode::S_IRUSR),
    )
}

/// Copy a FIFO into this process's stdout or stderr until aborted.
/// Opened read-write so the reader never sees EOF before the shim connects.
fn forward_fifo(path: &Path, to_stderr: bool) -> std::io::Result<JoinHandle<()>> {
    let mut receiver = tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;

    Ok(tokio::spawn(async move {
        let copied = if to_stderr {
            tokio::io::copy(&mut receiver, &mut tokio::io::stderr()).await
        } else {
            tokio::io::copy(&mut receiver, &mut tokio::io::stdout()).await
        };
        if let Err(e) = copied {
            tracing::debug!(error = %e, "Output forwarding stopped");
        }
    }))
}

/// OCI architecture name of the host
/// Host directories making up a snapshot's rootfs, topmost layer first.
/// `None` for mount types that can't be read without mounting.
fn rootfs_dirs(mounts: &[Mount]) -> Option<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for mount in mounts {
        match mount.r#type.as_str() {
            "overlay" => {
                let mut lower = Vec::new();
                for option in &mount.options {
                    if let Some(upper) = option.strip_prefix("upperdir=") {
                        dirs.push(PathBuf::from(upper));
                    } else if let Some(list) = option.strip_prefix("lowerdir=") {
                        lower.extend(list.split(':').map(PathBuf::from));
                    }
                }
                dirs.extend(lower);
            }
            "bind" | "rbind" => dirs.push(PathBuf::from(&mount.source)),
            _ => return None,
        }
    }
    Some(dirs)
}

/// Read `path` from the first layer directory that has it
async fn read_layered(dirs: &[PathBuf], path: &str) -> std::io::Result<Option<Vec<u8>>> {
    let relative = path.trim_start_matches('/');
    for dir in dirs {
        match fs::read(dir.join(relative)).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        arch => arch,
    }
}

/// Pick the linux manifest for `arch` out of an image index
fn select_platform_manifest(index: &serde_json::Value, arch: &str) -> Option<String> {
    index["manifests"]
        .as_array()?
        .iter()
        .find(|m| m["platform"]["os"] == "linux" && m["platform"]["architecture"] == arch)
        .and_then(|m| m["digest"].as_str())
        .map(String::from)
}

fn exit_time(timestamp: Option<prost_types::Timestamp>) -> SystemTime {
    timestamp
        .and_then(|ts| SystemTime::try_from(ts).ok())
        .unwrap_or_else(SystemTime::now)
}

#[async_trait::async_trait]
impl ContainerRuntime for ContainerdRuntime {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn namespace(&self) -> &str {
        self.ns()
    }

    async fn lookup_image(&self, reference: &str) -> Result<Option<ImageContent>> {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = with_namespace!(
            GetImageRequest {
                name: reference.to_string()
            },
            self.ns()
        );

        let image = match client.get(request).await {
            Ok(response) => response.into_inner().image,
            Err(status) if status.code() == tonic::Code::NotFound => None,
            Err(e) => {
                return Err(AgentError::ImageFetch {
                    image: reference.to_string(),
                    reason: format!("failed to get image: {}", e),
                })
            }
        };
        let Some(image) = image else {
            return Ok(None);
        };

        let target = image.target.ok_or_else(|| AgentError::ImageFormat {
            image: reference.to_string(),
            reason: "image has no target".to_string(),
        })?;
        let config = self.image_config(reference, &target.digest).await?;

        Ok(Some(ImageContent {
            name: reference.to_string(),
            digest: target.digest,
            config,
        }))
    }

    /// Pull an image to local storage using TransferClient
    async fn pull_image(&self, reference: &str, unpack: bool) -> Result<ImageContent> {
        let mut client = TransferClient::new(self.channel.clone());

        let source = OciRegistry {
            reference: reference.to_string(),
            resolver: None,
        };

        let platform = Platform {
            os: "linux".to_string(),
            architecture: oci_arch().to_string(),
            variant: String::new(),
            os_version: String::new(),
        };

        let unpacks = if unpack {
            vec![UnpackConfiguration {
                platform: Some(platform.clone()),
                snapshotter: self.config.snapshotter.clone(),
            }]
        } else {
            Vec::new()
        };

        let destination = ImageStore {
            name: reference.to_string(),
            labels: HashMap::new(),
            platforms: vec![platform],
            all_metadata: false,
            manifest_limit: 0,
            extra_references: vec![],
            unpacks,
        };

        let request = with_namespace!(
            TransferRequest {
                source: Some(to_any(&source)),
                destination: Some(to_any(&destination)),
                options: None,
            },
            self.ns()
        );

        client
            .transfer(request)
            .await
            .map_err(|e| AgentError::ImageFetch {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;

        self.lookup_image(reference)
            .await?
            .ok_or_else(|| AgentError::ImageFetch {
                image: reference.to_string(),
                reason: "image missing from store after pull".to_string(),
            })
    }

    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = with_namespace!(
            PrepareSnapshotRequest {
                snapshotter: self.config.snapshotter.clone(),
                key: key.to_string(),
                parent: parent.to_string(),
                labels: HashMap::new(),
            },
            self.ns()
        );

        client
            .prepare(request)
            .await
            .map_err(|e| AgentError::ContainerCreate {
                id: key.to_string(),
                reason: format!("failed to prepare snapshot: {}", e),
            })?;
        Ok(())
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = with_namespace!(
            RemoveSnapshotRequest {
                snapshotter: self.config.snapshotter.clone(),
                key: key.to_string(),
            },
            self.ns()
        );

        client
            .remove(request)
            .await
            .map_err(|e| AgentError::ContainerDelete {
                id: key.to_string(),
                reason: format!("failed to remove snapshot: {}", e),
            })?;
        Ok(())
    }

    async fn read_rootfs_file(&self, snapshot_key: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let read_err = |reason: String| AgentError::ContainerCreate {
            id: snapshot_key.to_string(),
            reason,
        };

        let mounts = self
            .snapshot_mounts(snapshot_key)
            .await
            .map_err(|e| read_err(format!("failed to get snapshot mounts: {}", e)))?;
        let dirs = rootfs_dirs(&mounts).ok_or_else(|| {
            read_err(format!(
                "cannot read {} from a {} snapshot",
                path, self.config.snapshotter
            ))
        })?;

        read_layered(&dirs, path)
            .await
            .map_err(|e| read_err(format!("failed to read {}: {}", path, e)))
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<()> {
        let create_err = |reason: String| AgentError::ContainerCreate {
            id: request.id.clone(),
            reason,
        };

        let spec_json = serde_json::to_vec(&request.spec)
            .map_err(|e| create_err(format!("failed to serialize OCI spec: {}", e)))?;

        let container = Container {
            id: request.id.clone(),
            labels: request.labels.clone(),
            image: request.image.clone(),
            runtime: Some(ContainerdRuntimeInfo {
                name: self.config.runtime.clone(),
                options: None,
            }),
            spec: Some(prost_types::Any {
                type_url: SPEC_TYPE_URL.to_string(),
                value: spec_json,
            }),
            snapshotter: self.config.snapshotter.clone(),
            snapshot_key: request.snapshot_key.clone(),
            extensions: HashMap::new(),
            sandbox: String::new(),
            created_at: None,
            updated_at: None,
        };

        let mut client = ContainersClient::new(self.channel.clone());
        let create_request = with_namespace!(
            CreateContainerRequest {
                container: Some(container),
            },
            self.ns()
        );

        client
            .create(create_request)
            .await
            .map_err(|e| create_err(format!("failed to create container: {}", e)))?;

        self.snapshots
            .write()
            .await
            .insert(request.id.clone(), request.snapshot_key.clone());
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = with_namespace!(DeleteContainerRequest { id: id.to_string() }, self.ns());

        client
            .delete(request)
            .await
            .map_err(|e| AgentError::ContainerDelete {
                id: id.to_string(),
                reason: format!("failed to delete container: {}", e),
            })?;

        self.snapshots.write().await.remove(id);
        Ok(())
    }

    async fn create_task(&self, id: &str, stdio: StdioMode) -> Result<u32> {
        let snapshot_key = self.snapshot_key(id).await?;
        let mounts = self
            .snapshot_mounts(&snapshot_key)
            .await
            .map_err(|e| AgentError::TaskCreate {
                id: id.to_string(),
                reason: format!("failed to get snapshot mounts: {}", e),
            })?;

        let io = match stdio {
            StdioMode::Inherit => Some(self.open_io(id).await?),
            StdioMode::Null => None,
        };
        let fifo = |name: &str| {
            io.as_ref()
                .map(|io| io.dir.join(name).to_string_lossy().to_string())
                .unwrap_or_default()
        };

        let mut client = TasksClient::new(self.channel.clone());
        let request = with_namespace!(
            CreateTaskRequest {
                container_id: id.to_string(),
                rootfs: mounts,
                stdin: String::new(),
                stdout: fifo("stdout"),
                stderr: fifo("stderr"),
                terminal: false,
                checkpoint: None,
                options: None,
                runtime_path: String::new(),
            },
            self.ns()
        );

        let pid = match client.create(request).await {
            Ok(response) => response.into_inner().pid,
            Err(e) => {
                if let Some(io) = io {
                    io.close().await;
                }
                return Err(AgentError::TaskCreate {
                    id: id.to_string(),
                    reason: format!("failed to create task: {}", e),
                });
            }
        };

        if let Some(io) = io {
            self.io.lock().await.insert(id.to_string(), io);
        }
        Ok(pid)
    }

    async fn watch_exit(&self, id: &str) -> Result<ExitReceiver> {
        let (tx, rx) = oneshot::channel();
        let mut client = TasksClient::new(self.channel.clone());
        let request = with_namespace!(
            WaitRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            },
            self.ns()
        );
        let container_id = id.to_string();

        // The Wait RPC may not be sent yet when this returns. containerd keeps
        // a stopped task's exit status until the task is deleted, so a Wait
        // that lands after the exit still observes it.
        tokio::spawn(async move {
            let result = match client.wait(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    Ok(ExitStatus {
                        code: response.exit_status,
                        exited_at: exit_time(response.exited_at),
                    })
                }
                Err(e) => Err(AgentError::Watch {
                    id: container_id,
                    reason: format!("wait failed: {}", e),
                }),
            };
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = with_namespace!(
            StartRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            },
            self.ns()
        );

        client
            .start(request)
            .await
            .map_err(|e| AgentError::TaskStart {
                id: id.to_string(),
                reason: format!("failed to start task: {}", e),
            })?;
        Ok(())
    }

    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = with_namespace!(
            KillRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
                signal: signal as u32,
                all: true,
            },
            self.ns()
        );

        client
            .kill(request)
            .await
            .map_err(|e| AgentError::TaskKill {
                id: id.to_string(),
                reason: format!("failed to send {}: {}", signal, e),
            })?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = with_namespace!(
            DeleteTaskRequest {
                container_id: id.to_string(),
            },
            self.ns()
        );

        client
            .delete(request)
            .await
            .map_err(|e| AgentError::TaskDelete {
                id: id.to_string(),
                reason: format!("failed to delete task: {}", e),
            })?;

        if let Some(io) = self.io.lock().await.remove(id) {
            io.close().await;
        }
        Ok(())
    }
}
