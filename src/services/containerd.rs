//! containerd adapter
//!
//! Writes the CRI config, runs the daemon from the materialized runtime
//! directory and waits for its gRPC socket. Once the socket answers it is linked
//! to the well-known system location and the bundled images are imported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{path_arg, run_component, wait_for_unix_socket};
use crate::bundle::Bundle;
use crate::config::{Config, Paths, SystemPaths};
use crate::filesystem::{self, MODE_PUBLIC};
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{Error, Result, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL, DEFAULT_SANDBOX_IMAGE};

/// Service name
pub const NAME: &str = "containerd";

/// Containerd namespace the kubelet uses
const K8S_NAMESPACE: &str = "k8s.io";

/// Archive name prefix of images only the edge agent needs
const EDGE_AGENT_IMAGE_PREFIX: &str = "portainer";

/// Render the containerd TOML config
pub fn render_config(paths: &Paths, system: &SystemPaths) -> Result<String> {
    let config = json!({
        "version": 3,
        "root": path_arg(&paths.containerd_root_dir),
        "state": path_arg(&paths.containerd_state_dir),
        "grpc": {
            "address": path_arg(&paths.containerd_socket),
            "uid": 0,
            "gid": 0
        },
        "plugins": {
            "io.containerd.cri.v1.images": {
                "snapshotter": "overlayfs",
                "max_concurrent_downloads": 3,
                "pinned_images": { "sandbox": DEFAULT_SANDBOX_IMAGE }
            },
            "io.containerd.cri.v1.runtime": {
                "enable_unprivileged_ports": true,
                "enable_unprivileged_icmp": true,
                "enable_cdi": true,
                "tolerate_missing_hugetlb_controller": true,
                "disable_hugetlb_controller": true,
                "containerd": {
                    "default_runtime_name": "runc",
                    "runtimes": {
                        "runc": {
                            "runtime_type": "io.containerd.runc.v2",
                            "sandboxer": "podsandbox",
                            "options": { "BinaryName": path_arg(&paths.runc_binary) }
                        }
                    }
                },
                "cni": {
                    "bin_dir": path_arg(&system.cni_bin_dir),
                    "conf_dir": path_arg(&system.cni_conf_dir),
                    "max_conf_num": 1
                }
            },
            "io.containerd.grpc.v1.cri": {
                "disable_tcp_service": true,
                "stream_server_address": "127.0.0.1",
                "stream_server_port": "0"
            }
        }
    });

    let value = toml::Value::try_from(config)
        .map_err(|e| Error::serialization(format!("failed to convert containerd config: {}", e)))?;
    toml::to_string(&value)
        .map_err(|e| Error::serialization(format!("failed to encode containerd config: {}", e)))
}

/// Process spec for the daemon
pub fn process_spec(paths: &Paths) -> ProcessSpec {
    let search_path = match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}:{}", paths.containerd_bin_dir.display(), existing)
        }
        _ => path_arg(&paths.containerd_bin_dir),
    };

    ProcessSpec::new(NAME, &paths.containerd_binary)
        .args(["--config".to_string(), path_arg(&paths.containerd_config)])
        .env("PATH", search_path)
}

/// Image archives to import, sorted by name
///
/// Edge agent archives are skipped unless the agent is going to be deployed.
pub fn image_archives(dir: &Path, include_edge_agent: bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut archives: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            include_edge_agent || !name.starts_with(EDGE_AGENT_IMAGE_PREFIX)
        })
        .collect();
    archives.sort();
    archives
}

/// containerd as a chain service
pub struct Containerd {
    paths: Paths,
    system: SystemPaths,
    ctr: PathBuf,
    import_edge_agent: bool,
}

impl Containerd {
    /// Adapter for `config`, importing images with the bundle's `ctr`
    pub fn new(config: &Config, bundle: Bundle) -> Self {
        Self {
            paths: config.paths.clone(),
            system: config.system.clone(),
            ctr: bundle.binary("ctr"),
            import_edge_agent: config.edge.is_enabled(),
        }
    }

    fn write_config(&self) -> Result<()> {
        filesystem::ensure_dir(&self.paths.containerd_root_dir)?;
        filesystem::ensure_dir(&self.paths.containerd_state_dir)?;
        let rendered = render_config(&self.paths, &self.system)?;
        filesystem::write_file(&self.paths.containerd_config, rendered.as_bytes(), MODE_PUBLIC)
    }

    async fn import_images(&self) {
        for archive in image_archives(&self.paths.containerd_images_dir, self.import_edge_agent) {
            let output = tokio::process::Command::new(&self.ctr)
                .arg("-a")
                .arg(&self.paths.containerd_socket)
                .args(["-n", K8S_NAMESPACE, "images", "import"])
                .arg(&archive)
                .output()
                .await;

            match output {
                Ok(out) if out.status.success() => {
                    info!(archive = %archive.display(), "Imported image archive")
                }
                Ok(out) => warn!(
                    archive = %archive.display(),
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "Image import failed"
                ),
                Err(e) => warn!(archive = %archive.display(), error = %e, "Failed to run ctr"),
            }
        }
    }

    async fn confirm(&self) -> Result<()> {
        wait_for_unix_socket(
            &self.paths.containerd_socket,
            DEFAULT_RETRY_COUNT,
            DEFAULT_RETRY_INTERVAL,
        )
        .await?;
        filesystem::ensure_symlink(&self.paths.containerd_socket, &self.system.containerd_socket)?;
        debug!(link = %self.system.containerd_socket.display(), "Linked containerd socket");
        self.import_images().await;
        Ok(())
    }
}

#[async_trait]
impl Service for Containerd {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        self.write_config()?;
        run_component(process_spec(&self.paths), cancel, ready, || self.confirm()).await
    }
}
