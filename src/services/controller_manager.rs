//! kube-controller-manager adapter

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{apiserver, path_arg, run_component};
use crate::bundle::Bundle;
use crate::config::Paths;
use crate::filesystem;
use crate::health::HealthProbe;
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{Result, DEFAULT_POD_CIDR};

/// Service name
pub const NAME: &str = "controller-manager";

/// Health endpoint
pub const HEALTH_URL: &str = "https://127.0.0.1:10257/healthz";

/// Controllers a single node needs
const CONTROLLERS: &[&str] = &[
    "deployment",
    "replicaset",
    "service",
    "serviceaccount",
    "namespace",
    "attachdetach",
    "endpoint",
    "daemonset",
    "statefulset",
    "root-ca-certificate-publisher-controller",
    "serviceaccount-token-controller",
    "node-ipam-controller",
    "endpointslice-controller",
    "garbage-collector-controller",
    "ttl-after-finished-controller",
];

/// Sync loops throttled to one worker each
const SINGLE_WORKER_SYNCS: &[&str] = &[
    "deployment",
    "endpoint",
    "service",
    "rc",
    "replicaset",
    "namespace",
    "serviceaccount-token",
    "gc",
];

/// kube-controller-manager arguments
pub fn args(paths: &Paths) -> Vec<String> {
    let kubeconfig = path_arg(&paths.admin_kubeconfig);
    let ca = path_arg(&paths.ca.cert);

    let mut flags: Vec<(String, String)> = [
        ("service-account-private-key-file", path_arg(&paths.service_account_key)),
        ("kubeconfig", kubeconfig.clone()),
        ("authentication-kubeconfig", kubeconfig.clone()),
        ("authorization-kubeconfig", kubeconfig),
        ("root-ca-file", ca.clone()),
        ("requestheader-client-ca-file", ca),
        ("tls-cert-file", path_arg(&paths.controller_manager.cert)),
        ("tls-private-key-file", path_arg(&paths.controller_manager.key)),
        ("leader-elect", "false".into()),
        ("controllers", CONTROLLERS.join(",")),
        ("profiling", "false".into()),
        ("use-service-account-credentials", "true".into()),
        ("bind-address", "0.0.0.0".into()),
        ("secure-port", "10257".into()),
        ("allocate-node-cidrs", "true".into()),
        ("cluster-cidr", DEFAULT_POD_CIDR.into()),
        ("terminated-pod-gc-threshold", "0".into()),
        ("large-cluster-size-threshold", "10".into()),
        ("unhealthy-zone-threshold", "0.7".into()),
        ("node-monitor-period", "30s".into()),
        ("node-monitor-grace-period", "60s".into()),
        ("v", "0".into()),
    ]
    .into_iter()
    .map(|(flag, value)| (flag.to_string(), value))
    .collect();

    flags.extend(
        SINGLE_WORKER_SYNCS
            .iter()
            .map(|sync| (format!("concurrent-{}-syncs", sync), "1".to_string())),
    );

    flags
        .into_iter()
        .map(|(flag, value)| format!("--{}={}", flag, value))
        .collect()
}

/// kube-controller-manager as a chain service
pub struct ControllerManager {
    paths: Paths,
    binary: PathBuf,
}

impl ControllerManager {
    /// Adapter running the bundle's `kube-controller-manager`
    pub fn new(paths: &Paths, bundle: &Bundle) -> Self {
        Self {
            paths: paths.clone(),
            binary: bundle.binary("kube-controller-manager"),
        }
    }
}

#[async_trait]
impl Service for ControllerManager {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        filesystem::ensure_dir(&self.paths.controller_manager_dir)?;
        // The API server must still answer before anything is started against it
        HealthProbe::insecure_https(NAME, apiserver::HEALTH_URL)?
            .wait_healthy(&cancel)
            .await?;

        let spec = ProcessSpec::new(NAME, &self.binary).args(args(&self.paths));
        let probe = HealthProbe::insecure_https(NAME, HEALTH_URL)?;
        let probe_cancel = cancel.clone();
        run_component(spec, cancel, ready, || async move {
            probe.wait_healthy(&probe_cancel).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_args() -> Vec<String> {
        args(&Paths::new("/var/lib/edgekube"))
    }

    fn flag(name: &str) -> Option<String> {
        let prefix = format!("--{}=", name);
        test_args()
            .iter()
            .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
    }

    #[test]
    fn talks_to_the_cluster_as_admin() {
        let admin = "/var/lib/edgekube/pki/admin/admin.kubeconfig";
        assert_eq!(flag("kubeconfig").as_deref(), Some(admin));
        assert_eq!(flag("authentication-kubeconfig").as_deref(), Some(admin));
        assert_eq!(flag("authorization-kubeconfig").as_deref(), Some(admin));
    }

    #[test]
    fn serves_with_its_own_certificate() {
        assert_eq!(
            flag("tls-cert-file").as_deref(),
            Some("/var/lib/edgekube/pki/controller-manager/controller-manager.crt")
        );
        assert_eq!(flag("secure-port").as_deref(), Some("10257"));
    }

    #[test]
    fn allocates_pod_cidrs_without_leader_election() {
        assert_eq!(flag("leader-elect").as_deref(), Some("false"));
        assert_eq!(flag("allocate-node-cidrs").as_deref(), Some("true"));
        assert_eq!(flag("cluster-cidr").as_deref(), Some("10.42.0.0/16"));
    }

    #[test]
    fn controller_list_includes_node_ipam() {
        let controllers = flag("controllers").unwrap();
        assert!(controllers.split(',').any(|c| c == "node-ipam-controller"));
        assert_eq!(controllers.split(',').count(), 15);
    }

    #[test]
    fn sync_loops_run_single_worker() {
        for sync in SINGLE_WORKER_SYNCS {
            assert_eq!(
                flag(&format!("concurrent-{}-syncs", sync)).as_deref(),
                Some("1")
            );
        }
    }
}
