//! Container creation
//!
//! Allocates a uniquely named container and the writable snapshot backing its
//! root filesystem. A named image user is resolved against that snapshot's
//! `/etc/passwd` and `/etc/group` before the container is registered.

use crate::error::{AgentError, Result};
use crate::image::Image;
use crate::runtime::{ContainerRequest, ContainerRuntime};
use crate::sandbox::SandboxSpec;
use crate::user::{self, GROUP_PATH, PASSWD_PATH};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Instrument;

/// Label carrying the workload's base name
pub const NAME_LABEL: &str = "io.runlet.name";
/// Label carrying the image reference
pub const IMAGE_LABEL: &str = "io.runlet.image";

/// Source of the salt used to derive container name suffixes
pub trait SeedSource: Send + Sync {
    fn seed(&self) -> String;
}

/// Wall-clock timestamp plus a random UUID
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockSeed;

impl SeedSource for ClockSeed {
    fn seed(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        format!("{}-{}", nanos, uuid::Uuid::new_v4())
    }
}

/// Always the same seed, for reproducible names
#[derive(Debug, Clone)]
pub struct FixedSeed(pub String);

impl SeedSource for FixedSeed {
    fn seed(&self) -> String {
        self.0.clone()
    }
}

/// First 8 hex characters of SHA-256 over the seed
pub fn name_suffix(seed: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(seed.as_bytes()));
    digest[..8].to_string()
}

/// Snapshot key bound to a container id
pub fn snapshot_key(container_id: &str) -> String {
    format!("{}-snapshot", container_id)
}

/// A container created for this run
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub snapshot_key: String,
    pub image: String,
    pub spec: SandboxSpec,
}

/// Creates containers and their snapshots through a runtime
pub struct ContainerFactory {
    runtime: Arc<dyn ContainerRuntime>,
    seeds: Arc<dyn SeedSource>,
}

impl ContainerFactory {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            seeds: Arc::new(ClockSeed),
        }
    }

    /// Replace the naming seed source
    pub fn with_seed_source(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Generate `<base>-<suffix>` from a fresh seed
    pub fn container_name(&self, base: &str) -> String {
        format!("{}-{}", base, name_suffix(&self.seeds.seed()))
    }

    /// Create a uniquely named container from `base`, backed by a new snapshot
    /// of `image`. The snapshot is removed again if the container can't be made.
    pub async fn create(
        &self,
        base: &str,
        image: &Image,
        mut spec: SandboxSpec,
    ) -> Result<Container> {
        let id = self.container_name(base);
        let snapshot_key = snapshot_key(&id);

        let span = tracing::info_span!(
            "container.create",
            container.id = %id,
            container.image.name = %image.name,
        );

        async {
            self.runtime
                .prepare_snapshot(&snapshot_key, &image.chain_id)
                .await?;
            tracing::debug!(snapshot = %snapshot_key, parent = %image.chain_id, "Snapshot prepared");

            if let Err(e) = self
                .register(&id, base, &snapshot_key, image, &mut spec)
                .await
            {
                if let Err(rollback) = self.runtime.remove_snapshot(&snapshot_key).await {
                    tracing::warn!(
                        snapshot = %snapshot_key,
                        error = %rollback,
                        "Failed to roll back snapshot"
                    );
                }
                return Err(e);
            }

            tracing::info!("Container created");
            Ok(Container {
                id: id.clone(),
                snapshot_key: snapshot_key.clone(),
                image: image.name.clone(),
                spec,
            })
        }
        .instrument(span)
        .await
    }

    /// Resolve the image user against the prepared snapshot, then register
    /// the container
    async fn register(
        &self,
        id: &str,
        base: &str,
        snapshot_key: &str,
        image: &Image,
        spec: &mut SandboxSpec,
    ) -> Result<()> {
        if let Some(name) = spec.pending_user.clone() {
            let passwd = self.read_text(snapshot_key, PASSWD_PATH).await?;
            let group = self.read_text(snapshot_key, GROUP_PATH).await?;
            let resolved = user::resolve_user(&name, passwd.as_deref(), group.as_deref())?;
            tracing::debug!(
                user = %name,
                uid = resolved.uid,
                gid = resolved.gid,
                "Resolved image user"
            );
            spec.set_user(resolved)?;
        }

        let request = ContainerRequest {
            id: id.to_string(),
            image: image.name.clone(),
            snapshot_key: snapshot_key.to_string(),
            spec: spec.oci.clone(),
            labels: HashMap::from([
                (NAME_LABEL.to_string(), base.to_string()),
                (IMAGE_LABEL.to_string(), image.name.clone()),
            ]),
        };

        self.runtime
            .create_container(&request)
            .await
            .map_err(|e| match e {
                e @ AgentError::ContainerCreate { .. } => e,
                other => AgentError::ContainerCreate {
                    id: id.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    async fn read_text(&self, snapshot_key: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .runtime
            .read_rootfs_file(snapshot_key, path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageProcess;
    use crate::runtime::{FailPoint, MockRuntime, MockWorkload, RuntimeEvent};
    use crate::sandbox::SandboxSpecBuilder;
    use runlet_spec::NamespaceSharing;
    use std::time::Duration;

    fn image() -> Image {
        Image {
            name: "app:1".to_string(),
            digest: "sha256:abc".to_string(),
            chain_id: "sha256:aaa".to_string(),
            process: ImageProcess {
                cmd: vec!["/bin/true".to_string()],
                ..Default::default()
            },
        }
    }

    fn spec() -> SandboxSpec {
        SandboxSpecBuilder::new()
            .build(&image(), &[], NamespaceSharing::default())
            .unwrap()
    }

    fn runtime() -> MockRuntime {
        MockRuntime::new().with_image("app:1", MockWorkload::new(Duration::from_secs(1), 0))
    }

    #[test]
    fn test_suffix_is_eight_hex_chars() {
        let suffix = name_suffix("seed");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(suffix, name_suffix("seed"));
    }

    #[test]
    fn test_clock_seeds_differ_within_a_tick() {
        let factory = ContainerFactory::new(Arc::new(MockRuntime::new()));
        let a = factory.container_name("simple-api");
        let b = factory.container_name("simple-api");
        assert_ne!(a, b);
        assert!(a.starts_with("simple-api-"));
    }

    #[tokio::test]
    async fn test_create_binds_snapshot() {
        let runtime = Arc::new(runtime());
        let factory = ContainerFactory::new(runtime.clone())
            .with_seed_source(Arc::new(FixedSeed("fixed".to_string())));

        let container = factory.create("simple-api", &image(), spec()).await.unwrap();

        let expected = format!("simple-api-{}", name_suffix("fixed"));
        assert_eq!(container.id, expected);
        assert_eq!(container.snapshot_key, format!("{}-snapshot", expected));
        assert_eq!(
            runtime.events().await,
            vec![
                RuntimeEvent::PrepareSnapshot {
                    key: container.snapshot_key.clone(),
                    parent: "sha256:aaa".to_string(),
                },
                RuntimeEvent::CreateContainer(container.id.clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back_snapshot() {
        let runtime = Arc::new(runtime().failing_at(FailPoint::CreateContainer));
        let factory = ContainerFactory::new(runtime.clone());

        let err = factory
            .create("simple-api", &image(), spec())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ContainerCreate { .. }));
        assert!(runtime.live_snapshots().await.is_empty());
        assert!(runtime.live_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_named_user_resolved_from_snapshot() {
        let runtime = Arc::new(
            runtime()
                .with_rootfs_file(PASSWD_PATH, "root:x:0:0::/root:/bin/sh\nnode:x:1000:1000::/home/node:/bin/sh\n")
                .with_rootfs_file(GROUP_PATH, "root:x:0:\nnode:x:1000:\nvideo:x:44:node\n"),
        );
        let factory = ContainerFactory::new(runtime.clone());
        let mut img = image();
        img.process.user = Some("node".to_string());
        let spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();

        let container = factory.create("simple-api", &img, spec).await.unwrap();

        assert_eq!(container.spec.pending_user, None);
        let registered = runtime.container_spec(&container.id).await.unwrap();
        let user = registered.process().as_ref().unwrap().user().clone();
        assert_eq!((user.uid(), user.gid()), (1000, 1000));
        assert_eq!(user.additional_gids().clone(), Some(vec![44]));
    }

    #[tokio::test]
    async fn test_unknown_user_rolls_back_snapshot() {
        let runtime = Arc::new(runtime().with_rootfs_file(PASSWD_PATH, "root:x:0:0::/root:/bin/sh\n"));
        let factory = ContainerFactory::new(runtime.clone());
        let mut img = image();
        img.process.user = Some("postgres".to_string());
        let spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();

        let err = factory.create("simple-api", &img, spec).await.unwrap_err();

        assert!(matches!(err, AgentError::SpecBuild(_)));
        assert!(runtime.live_snapshots().await.is_empty());
        assert!(runtime.live_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_prepare_creates_nothing() {
        let runtime = Arc::new(runtime().failing_at(FailPoint::PrepareSnapshot));
        let factory = ContainerFactory::new(runtime.clone());

        assert!(factory.create("simple-api", &image(), spec()).await.is_err());
        assert!(runtime.events().await.is_empty());
    }
}
