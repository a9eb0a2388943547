//! Image resolution
//!
//! Turns an image reference into a locally usable [`Image`]: pulled and unpacked
//! according to the pull policy, with its process configuration parsed and its
//! snapshot parent (chain ID) derived.

use crate::error::{AgentError, Result};
use crate::runtime::{ContainerRuntime, ImageContent};
use runlet_spec::PullPolicy;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::Instrument;

/// Process defaults declared by an image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProcess {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

/// The parts of an OCI image config blob we read. Everything but `rootfs`
/// is optional, as in the image spec (`history` is routinely absent).
#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: Option<ProcessConfig>,
    rootfs: RootFs,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessConfig {
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// A resolved, locally available image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Reference the image was resolved from
    pub name: String,
    /// Manifest digest
    pub digest: String,
    /// Chain ID of the layer stack; parent for container snapshots
    pub chain_id: String,
    /// Declared process configuration
    pub process: ImageProcess,
}

impl Image {
    /// Parse stored image content
    pub fn from_content(content: &ImageContent) -> Result<Self> {
        let format_err = |reason: String| AgentError::ImageFormat {
            image: content.name.clone(),
            reason,
        };

        let blob: ConfigBlob = serde_json::from_slice(&content.config)
            .map_err(|e| format_err(format!("failed to parse config: {}", e)))?;

        if blob.rootfs.diff_ids.is_empty() {
            return Err(format_err("config has no diff_ids".to_string()));
        }

        let c = blob.config.unwrap_or_default();
        let process = ImageProcess {
            entrypoint: c.entrypoint.unwrap_or_default(),
            cmd: c.cmd.unwrap_or_default(),
            env: c.env.unwrap_or_default(),
            working_dir: c.working_dir.filter(|d| !d.is_empty()),
            user: c.user.filter(|u| !u.is_empty()),
        };

        Ok(Self {
            name: content.name.clone(),
            digest: content.digest.clone(),
            chain_id: compute_chain_id(&blob.rootfs.diff_ids),
            process,
        })
    }
}

/// Compute the chain ID from diff IDs (OCI image spec algorithm)
pub fn compute_chain_id(diff_ids: &[String]) -> String {
    let mut chain_id = String::new();
    for diff_id in diff_ids {
        if chain_id.is_empty() {
            chain_id = diff_id.clone();
        } else {
            let mut hasher = Sha256::new();
            hasher.update(format!("{} {}", chain_id, diff_id).as_bytes());
            chain_id = format!("sha256:{:x}", hasher.finalize());
        }
    }
    chain_id
}

/// Resolves image references against a runtime's image store
pub struct ImageProvider {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageProvider {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Return a locally usable image, pulling it if the policy calls for it
    pub async fn resolve(&self, reference: &str, policy: PullPolicy) -> Result<Image> {
        let span = tracing::info_span!(
            "image.pull",
            container.image.name = %reference,
            pull_policy = %policy,
        );

        async {
            let content = match policy {
                PullPolicy::Always => self.pull(reference).await?,
                PullPolicy::IfNotPresent => match self.runtime.lookup_image(reference).await? {
                    Some(content) => {
                        tracing::debug!("Image present locally, skipping pull");
                        content
                    }
                    None => self.pull(reference).await?,
                },
                PullPolicy::Never => self
                    .runtime
                    .lookup_image(reference)
                    .await?
                    .ok_or_else(|| AgentError::ImageFetch {
                        image: reference.to_string(),
                        reason: "not present locally and pull policy is never".to_string(),
                    })?,
            };

            let image = Image::from_content(&content)?;
            tracing::info!(
                digest = %image.digest,
                chain_id = %image.chain_id,
                "Image resolved"
            );
            Ok(image)
        }
        .instrument(span)
        .await
    }

    async fn pull(&self, reference: &str) -> Result<ImageContent> {
        tracing::info!("Pulling image");
        self.runtime.pull_image(reference, true).await
    }
}
