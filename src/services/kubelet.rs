//! kubelet adapter
//!
//! The kubelet starts only once containerd's socket exists. It gets a
//! KubeletConfiguration file tuned for small hosts and a kubeconfig referencing
//! its own certificate. Node RBAC is applied best-effort once the process runs,
//! then readiness is its authenticated `/healthz`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{path_arg, run_component};
use crate::bundle::Bundle;
use crate::config::{Config, Paths};
use crate::filesystem::{self, MODE_PUBLIC};
use crate::health::HealthProbe;
use crate::kube_client::{apply_all, ClusterApplier};
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{kubeconfig, rbac};
use crate::{Error, Result, DEFAULT_COREDNS_IP};

/// Service name
pub const NAME: &str = "kubelet";

/// Health endpoint, authenticated with the kubelet's own client certificate
pub const HEALTH_URL: &str = "https://127.0.0.1:10250/healthz";

/// KubeletConfiguration for this node
pub fn kubelet_configuration(paths: &Paths) -> Value {
    let runtime_endpoint = format!("unix://{}", paths.containerd_socket.display());

    json!({
        "kind": "KubeletConfiguration",
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "enableServer": true,
        "containerRuntimeEndpoint": runtime_endpoint,
        "imageServiceEndpoint": runtime_endpoint,
        "authentication": {
            "anonymous": { "enabled": false },
            "webhook": { "enabled": true, "cacheTTL": "5m0s" },
            "x509": { "clientCAFile": path_arg(&paths.ca.cert) }
        },
        "authorization": {
            "mode": "Webhook",
            "webhook": {
                "cacheAuthorizedTTL": "10m0s",
                "cacheUnauthorizedTTL": "1m0s"
            }
        },
        "clusterDomain": "cluster.local",
        "clusterDNS": [DEFAULT_COREDNS_IP],
        "resolvConf": "/etc/resolv.conf",
        "tlsCertFile": path_arg(&paths.kubelet.cert),
        "tlsPrivateKeyFile": path_arg(&paths.kubelet.key),
        "volumePluginDir": path_arg(&paths.kubelet_volume_plugin_dir),
        "cgroupDriver": "systemd",
        "registerNode": true,
        "readOnlyPort": 0,
        "port": 10250,
        "streamingConnectionIdleTimeout": "1h0m0s",
        "rotateCertificates": true,
        "registerWithTaints": [],
        "evictionHard": {
            "memory.available": "25Mi",
            "nodefs.available": "200Mi"
        },
        "systemReserved": { "memory": "25Mi" },
        "kubeReserved": { "memory": "25Mi" },
        "failSwapOn": false,
        "kubeAPIQPS": 1,
        "kubeAPIBurst": 2,
        "serializeImagePulls": true,
        "imagePullProgressDeadline": "1m",
        "imageGCHighThresholdPercent": 90,
        "imageGCLowThresholdPercent": 75,
        "registryPullQPS": 1,
        "registryBurst": 1,
        "eventRecordQPS": 1,
        "eventBurst": 1,
        "containerLogMaxSize": "512Ki",
        "enableProfilingHandler": false,
        "enableDebugFlagsHandler": false,
        "maxPods": 20,
        "featureGates": { "RotateKubeletServerCertificate": true }
    })
}

/// kubelet arguments
pub fn args(paths: &Paths, node_name: &str) -> Vec<String> {
    vec![
        "--config".to_string(),
        path_arg(&paths.kubelet_config_file),
        "--hostname-override".to_string(),
        node_name.to_string(),
        "--root-dir".to_string(),
        path_arg(&paths.kubelet_dir),
        "--kubeconfig".to_string(),
        path_arg(&paths.kubelet_kubeconfig),
        "--v".to_string(),
        "0".to_string(),
    ]
}

/// kubelet as a chain service
pub struct Kubelet {
    paths: Paths,
    node_name: String,
    binary: PathBuf,
    applier: Arc<dyn ClusterApplier>,
}

impl Kubelet {
    /// Adapter running the bundle's `kubelet`
    pub fn new(config: &Config, bundle: &Bundle, applier: Arc<dyn ClusterApplier>) -> Self {
        Self {
            paths: config.paths.clone(),
            node_name: config.node_name.clone(),
            binary: bundle.binary("kubelet"),
            applier,
        }
    }

    /// Directories and the runtime socket the kubelet depends on
    fn validate(&self) -> Result<()> {
        filesystem::ensure_dir(&self.paths.kubelet_dir)?;
        if !filesystem::file_exists(&self.paths.containerd_socket) {
            return Err(Error::filesystem(format!(
                "containerd socket {} does not exist",
                self.paths.containerd_socket.display()
            )));
        }
        Ok(())
    }

    fn write_inputs(&self) -> Result<()> {
        kubeconfig::write_kubelet_kubeconfig(&self.paths, &self.node_name)?;

        let rendered = serde_yaml::to_string(&kubelet_configuration(&self.paths))
            .map_err(|e| Error::serialization(format!("failed to encode kubelet config: {}", e)))?;
        filesystem::write_file(&self.paths.kubelet_config_file, rendered.as_bytes(), MODE_PUBLIC)?;
        debug!(
            component = NAME,
            path = %self.paths.kubelet_config_file.display(),
            "Wrote kubelet config"
        );
        Ok(())
    }

    async fn apply_node_rbac(&self) {
        match rbac::node_manifests(&self.node_name) {
            Ok(manifests) => {
                if let Err(e) = apply_all(self.applier.as_ref(), &manifests).await {
                    warn!(component = NAME, error = %e, "Failed to apply node RBAC");
                }
            }
            Err(e) => warn!(component = NAME, error = %e, "Failed to render node RBAC"),
        }
    }

    async fn confirm(&self, cancel: &CancellationToken) -> Result<()> {
        self.apply_node_rbac().await;

        let read = |path: &std::path::Path| {
            std::fs::read(path).map_err(|e| {
                Error::filesystem(format!("failed to read {}: {}", path.display(), e))
            })
        };
        let cert = read(&self.paths.kubelet.cert)?;
        let key = read(&self.paths.kubelet.key)?;

        HealthProbe::mutual_tls(NAME, HEALTH_URL, &cert, &key)?
            .wait_healthy(cancel)
            .await
    }
}

#[async_trait]
impl Service for Kubelet {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        self.validate()?;
        self.write_inputs()?;

        let spec = ProcessSpec::new(NAME, &self.binary).args(args(&self.paths, &self.node_name));
        let probe_cancel = cancel.clone();
        run_component(spec, cancel, ready, || async move {
            self.confirm(&probe_cancel).await
        })
        .await
    }
}
