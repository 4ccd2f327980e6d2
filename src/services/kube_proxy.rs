//! kube-proxy adapter: iptables mode, talking to the API server as admin

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{path_arg, run_component};
use crate::bundle::Bundle;
use crate::config::Paths;
use crate::health::HealthProbe;
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{Result, DEFAULT_POD_CIDR};

/// Service name
pub const NAME: &str = "kube-proxy";

/// Health endpoint
pub const HEALTH_URL: &str = "http://127.0.0.1:10256/healthz";

/// kube-proxy arguments
pub fn args(paths: &Paths) -> Vec<String> {
    [
        ("kubeconfig", path_arg(&paths.admin_kubeconfig)),
        ("cluster-cidr", DEFAULT_POD_CIDR.to_string()),
        ("oom-score-adj", "-998".to_string()),
        ("metrics-bind-address", String::new()),
        ("profiling", "false".to_string()),
        ("iptables-masquerade-bit", "14".to_string()),
        ("masquerade-all", "true".to_string()),
        ("proxy-mode", "iptables".to_string()),
        ("conntrack-max-per-core", "1024".to_string()),
        ("conntrack-min", "1024".to_string()),
        ("min-sync-period", "10s".to_string()),
    ]
    .into_iter()
    .map(|(flag, value)| format!("--{}={}", flag, value))
    .collect()
}

/// kube-proxy as a chain service
pub struct KubeProxy {
    binary: PathBuf,
    args: Vec<String>,
}

impl KubeProxy {
    /// Adapter running the bundle's `kube-proxy`
    pub fn new(paths: &Paths, bundle: &Bundle) -> Self {
        Self {
            binary: bundle.binary(NAME),
            args: args(paths),
        }
    }
}

#[async_trait]
impl Service for KubeProxy {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        let spec = ProcessSpec::new(NAME, &self.binary).args(self.args.clone());
        let probe = HealthProbe::http(NAME, HEALTH_URL)?;
        let probe_cancel = cancel.clone();
        run_component(spec, cancel, ready, || async move {
            probe.wait_healthy(&probe_cancel).await
        })
        .await
    }
}
