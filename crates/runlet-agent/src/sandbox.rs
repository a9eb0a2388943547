//! Sandbox spec construction
//!
//! Combines the default OCI runtime spec, an image's declared process
//! configuration, environment overrides and namespace-sharing flags into an
//! immutable [`SandboxSpec`].

use crate::error::{AgentError, Result};
use crate::image::Image;
use crate::user::{self, ResolvedUser};
use oci_spec::runtime::{LinuxNamespaceType, Mount, MountBuilder, Spec, UserBuilder};
use runlet_spec::NamespaceSharing;
use std::path::PathBuf;

const DEFAULT_CWD: &str = "/";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const HOSTS_PATH: &str = "/etc/hosts";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Fully resolved sandbox configuration for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// OCI runtime spec handed to the runtime
    pub oci: Spec,
    /// Merged environment, keys unique, in first-seen order
    pub env: Vec<(String, String)>,
    /// Sharing flags the spec was built with
    pub sharing: NamespaceSharing,
    /// Image user that needs the rootfs passwd/group files to resolve. The
    /// OCI user stays `0:0` until [`SandboxSpec::set_user`] is called.
    pub pending_user: Option<String>,
}

impl SandboxSpec {
    /// Process arguments
    pub fn args(&self) -> Vec<String> {
        self.oci
            .process()
            .as_ref()
            .and_then(|p| p.args().clone())
            .unwrap_or_default()
    }

    /// Value of an environment variable, if set
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Apply resolved credentials to the process
    pub fn set_user(&mut self, resolved: ResolvedUser) -> Result<()> {
        let user = build_user(resolved)?;
        let mut process = self.oci.process().clone().unwrap_or_default();
        process.set_user(user);
        self.oci.set_process(Some(process));
        self.pending_user = None;
        Ok(())
    }
}

/// Builds [`SandboxSpec`]s without touching the host
#[derive(Debug, Clone, Default)]
pub struct SandboxSpecBuilder {
    base: Option<Spec>,
}

impl SandboxSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a custom base spec instead of the runtime default
    pub fn with_base(base: Spec) -> Self {
        Self { base: Some(base) }
    }

    pub fn build(
        &self,
        image: &Image,
        overrides: &[(String, String)],
        sharing: NamespaceSharing,
    ) -> Result<SandboxSpec> {
        let mut oci = self.base.clone().unwrap_or_default();
        oci.set_hostname(None);

        let args: Vec<String> = image
            .process
            .entrypoint
            .iter()
            .chain(image.process.cmd.iter())
            .cloned()
            .collect();
        if args.is_empty() {
            return Err(AgentError::SpecBuild(format!(
                "image '{}' declares no entrypoint or cmd",
                image.name
            )));
        }

        let env = merge_env(&image.process.env, overrides)?;
        let (resolved, pending_user) = match image.process.user.as_deref() {
            None => (ResolvedUser::default(), None),
            Some(u) => match user::parse_numeric(u) {
                Some((uid, gid)) => (
                    ResolvedUser {
                        uid,
                        gid,
                        additional_gids: Vec::new(),
                    },
                    None,
                ),
                None => (ResolvedUser::default(), Some(u.to_string())),
            },
        };
        let user = build_user(resolved)?;

        let mut process = oci.process().clone().unwrap_or_default();
        process.set_args(Some(args));
        process.set_env(Some(
            env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        ));
        process.set_cwd(PathBuf::from(
            image.process.working_dir.as_deref().unwrap_or(DEFAULT_CWD),
        ));
        process.set_user(user);
        process.set_terminal(Some(false));
        oci.set_process(Some(process));

        if sharing.host_network {
            if let Some(mut linux) = oci.linux().clone() {
                let namespaces = linux.namespaces().clone().map(|list| {
                    list.into_iter()
                        .filter(|ns| !matches!(ns.typ(), LinuxNamespaceType::Network))
                        .collect()
                });
                linux.set_namespaces(namespaces);
                oci.set_linux(Some(linux));
            }
        }

        let mut mounts = oci.mounts().clone().unwrap_or_default();
        if sharing.host_hosts_file {
            mounts.push(host_file_mount(HOSTS_PATH)?);
        }
        if sharing.host_resolv_conf {
            mounts.push(host_file_mount(RESOLV_CONF_PATH)?);
        }
        oci.set_mounts(Some(mounts));

        Ok(SandboxSpec {
            oci,
            env,
            sharing,
            pending_user,
        })
    }
}

fn host_file_mount(path: &str) -> Result<Mount> {
    MountBuilder::default()
        .destination(path)
        .typ("bind")
        .source(path)
        .options(vec!["rbind".to_string(), "ro".to_string()])
        .build()
        .map_err(|e| AgentError::SpecBuild(format!("failed to build mount for {}: {}", path, e)))
}

fn build_user(resolved: ResolvedUser) -> Result<oci_spec::runtime::User> {
    let mut builder = UserBuilder::default().uid(resolved.uid).gid(resolved.gid);
    if !resolved.additional_gids.is_empty() {
        builder = builder.additional_gids(resolved.additional_gids);
    }
    builder
        .build()
        .map_err(|e| AgentError::SpecBuild(format!("failed to build user: {}", e)))
}

/// Merge the default PATH, image env and overrides; later entries replace
/// earlier ones in place
fn merge_env(
    image_env: &[String],
    overrides: &[(String, String)],
) -> Result<Vec<(String, String)>> {
    let mut merged: Vec<(String, String)> = vec![("PATH".to_string(), DEFAULT_PATH.to_string())];

    let mut set = |key: String, value: String| {
        match merged.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => merged.push((key, value)),
        }
    };

    for entry in image_env {
        let (key, value) = entry
            .split_once('=')
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| {
                AgentError::SpecBuild(format!("malformed image env entry '{}'", entry))
            })?;
        set(key.to_string(), value.to_string());
    }

    for (key, value) in overrides {
        if key.is_empty() || key.contains('=') {
            return Err(AgentError::SpecBuild(format!(
                "invalid environment override key '{}'",
                key
            )));
        }
        set(key.clone(), value.clone());
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageProcess;

    fn image(process: ImageProcess) -> Image {
        Image {
            name: "app:1".to_string(),
            digest: "sha256:abc".to_string(),
            chain_id: "sha256:aaa".to_string(),
            process,
        }
    }

    fn node_image() -> Image {
        image(ImageProcess {
            entrypoint: vec!["docker-entrypoint.sh".to_string()],
            cmd: vec!["node".to_string(), "index.js".to_string()],
            env: vec![
                "PATH=/usr/bin:/bin".to_string(),
                "PORT=3000".to_string(),
            ],
            working_dir: Some("/app".to_string()),
            user: None,
        })
    }

    fn has_network_ns(spec: &SandboxSpec) -> bool {
        spec.oci
            .linux()
            .as_ref()
            .and_then(|l| l.namespaces().clone())
            .unwrap_or_default()
            .iter()
            .any(|ns| matches!(ns.typ(), LinuxNamespaceType::Network))
    }

    fn mount_destinations(spec: &SandboxSpec) -> Vec<PathBuf> {
        spec.oci
            .mounts()
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|m| m.destination().clone())
            .collect()
    }

    #[test]
    fn test_args_are_entrypoint_then_cmd() {
        let spec = SandboxSpecBuilder::new()
            .build(&node_image(), &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.args(), vec!["docker-entrypoint.sh", "node", "index.js"]);
        let cwd = spec.oci.process().as_ref().unwrap().cwd().clone();
        assert_eq!(cwd, PathBuf::from("/app"));
    }

    #[test]
    fn test_override_replaces_image_env() {
        let spec = SandboxSpecBuilder::new()
            .build(
                &node_image(),
                &[("PORT".to_string(), "8080".to_string())],
                NamespaceSharing::default(),
            )
            .unwrap();
        assert_eq!(spec.env_var("PORT"), Some("8080"));
        assert_eq!(spec.env.iter().filter(|(k, _)| k == "PORT").count(), 1);
        // replaced in place, not appended
        assert_eq!(spec.env[1].0, "PORT");
    }

    #[test]
    fn test_later_override_wins() {
        let spec = SandboxSpecBuilder::new()
            .build(
                &node_image(),
                &[
                    ("MODE".to_string(), "a".to_string()),
                    ("MODE".to_string(), "b".to_string()),
                ],
                NamespaceSharing::default(),
            )
            .unwrap();
        assert_eq!(spec.env_var("MODE"), Some("b"));
        let env = spec.oci.process().as_ref().unwrap().env().clone().unwrap();
        assert!(env.contains(&"MODE=b".to_string()));
        assert!(!env.contains(&"MODE=a".to_string()));
    }

    #[test]
    fn test_no_args_fails() {
        let err = SandboxSpecBuilder::new()
            .build(
                &image(ImageProcess::default()),
                &[],
                NamespaceSharing::default(),
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::SpecBuild(_)));
    }

    #[test]
    fn test_malformed_image_env_fails() {
        let mut img = node_image();
        img.process.env.push("BROKEN".to_string());
        assert!(SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .is_err());
    }

    #[test]
    fn test_bad_override_key_fails() {
        let err = SandboxSpecBuilder::new()
            .build(
                &node_image(),
                &[(String::new(), "x".to_string())],
                NamespaceSharing::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("override"));
    }

    #[test]
    fn test_numeric_user() {
        let mut img = node_image();
        img.process.user = Some("1000:2000".to_string());
        let spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();
        let user = spec.oci.process().as_ref().unwrap().user().clone();
        assert_eq!(user.uid(), 1000);
        assert_eq!(user.gid(), 2000);
    }

    #[test]
    fn test_named_user_is_left_pending() {
        let mut img = node_image();
        img.process.user = Some("node".to_string());
        let mut spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.pending_user.as_deref(), Some("node"));

        spec.set_user(ResolvedUser {
            uid: 1000,
            gid: 1000,
            additional_gids: vec![29],
        })
        .unwrap();
        let user = spec.oci.process().as_ref().unwrap().user().clone();
        assert_eq!((user.uid(), user.gid()), (1000, 1000));
        assert_eq!(user.additional_gids().clone(), Some(vec![29]));
        assert_eq!(spec.pending_user, None);
    }

    #[test]
    fn test_bare_uid_needs_lookup() {
        let mut img = node_image();
        img.process.user = Some("1000".to_string());
        let spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.pending_user.as_deref(), Some("1000"));
    }

    #[test]
    fn test_default_hostname_cleared() {
        let spec = SandboxSpecBuilder::new()
            .build(&node_image(), &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.oci.hostname(), &None);
    }

    #[test]
    fn test_default_path_kept_without_image_env() {
        let mut img = node_image();
        img.process.env = vec!["PORT=3000".to_string()];
        let spec = SandboxSpecBuilder::new()
            .build(&img, &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.env_var("PATH"), Some(DEFAULT_PATH));
        assert_eq!(spec.env[0].0, "PATH");

        // image PATH replaces the default
        let spec = SandboxSpecBuilder::new()
            .build(&node_image(), &[], NamespaceSharing::default())
            .unwrap();
        assert_eq!(spec.env_var("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(spec.env.iter().filter(|(k, _)| k == "PATH").count(), 1);
    }

    #[test]
    fn test_isolated_by_default() {
        let spec = SandboxSpecBuilder::new()
            .build(&node_image(), &[], NamespaceSharing::default())
            .unwrap();
        assert!(has_network_ns(&spec));
        assert!(!mount_destinations(&spec).contains(&PathBuf::from(HOSTS_PATH)));
    }

    #[test]
    fn test_host_sharing() {
        let spec = SandboxSpecBuilder::new()
            .build(&node_image(), &[], NamespaceSharing::host())
            .unwrap();
        assert!(!has_network_ns(&spec));
        let mounts = mount_destinations(&spec);
        assert!(mounts.contains(&PathBuf::from(HOSTS_PATH)));
        assert!(mounts.contains(&PathBuf::from(RESOLV_CONF_PATH)));
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = SandboxSpecBuilder::new();
        let a = builder
            .build(&node_image(), &[], NamespaceSharing::host())
            .unwrap();
        let b = builder
            .build(&node_image(), &[], NamespaceSharing::host())
            .unwrap();
        assert_eq!(a, b);
    }
}
