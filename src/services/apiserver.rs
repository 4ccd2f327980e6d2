//! kube-apiserver adapter
//!
//! Before the API server starts, the service-account signing key is generated and
//! the node-name webhook is started, since the API server calls it from its first
//! pod admission. Readiness is its `/healthz` answering over TLS. The admin
//! kubeconfig, the API-server RBAC and the webhook registration are then written on
//! a best-effort basis before readiness is fired, so later services and add-ons can
//! rely on the admin kubeconfig existing.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{path_arg, run_component};
use crate::bundle::Bundle;
use crate::config::{Config, Paths};
use crate::health::HealthProbe;
use crate::kube_client::{apply_all, ClusterApplier};
use crate::orchestrator::Service;
use crate::process::ProcessSpec;
use crate::readiness::ReadinessNotifier;
use crate::{kubeconfig, network, pki, rbac, webhook};
use crate::{Result, DEFAULT_KINE_ENDPOINT, DEFAULT_SERVICE_CIDR};

/// Service name
pub const NAME: &str = "apiserver";

/// Health endpoint
pub const HEALTH_URL: &str = "https://127.0.0.1:6443/healthz";

/// Admission plugins enabled on top of the defaults
const ENABLED_ADMISSION_PLUGINS: &str = "NodeRestriction,ServiceAccount,MutatingAdmissionWebhook";

/// Default admission plugins a single node has no use for
const DISABLED_ADMISSION_PLUGINS: &[&str] = &[
    "ValidatingAdmissionWebhook",
    "RuntimeClass",
    "PodSecurity",
    "CertificateApproval",
    "CertificateSigning",
    "ClusterTrustBundleAttest",
    "CertificateSubjectRestriction",
    "MutatingAdmissionPolicy",
    "ValidatingAdmissionPolicy",
    "DefaultIngressClass",
    "TaintNodesByCondition",
    "Priority",
    "DefaultTolerationSeconds",
    "DefaultStorageClass",
    "StorageObjectInUseProtection",
    "PersistentVolumeClaimResize",
    "ResourceQuota",
    "LimitRanger",
];

/// Service account issuer and API audience
const SERVICE_ACCOUNT_ISSUER: &str = "kubernetes.default.svc";

/// kube-apiserver arguments for a node advertising `node_ip`
pub fn args(paths: &Paths, node_ip: Ipv4Addr) -> Vec<String> {
    let sa_key = path_arg(&paths.service_account_key);
    let cert = path_arg(&paths.apiserver.cert);
    let key = path_arg(&paths.apiserver.key);

    let flags: Vec<(&str, String)> = vec![
        ("etcd-servers", format!("http://{}", DEFAULT_KINE_ENDPOINT)),
        ("secure-port", "6443".into()),
        ("bind-address", "0.0.0.0".into()),
        ("advertise-address", node_ip.to_string()),
        ("cert-dir", path_arg(&paths.apiserver.dir)),
        ("tls-cert-file", cert.clone()),
        ("tls-private-key-file", key.clone()),
        ("client-ca-file", path_arg(&paths.ca.cert)),
        ("kubelet-client-certificate", cert),
        ("kubelet-client-key", key),
        ("service-account-issuer", SERVICE_ACCOUNT_ISSUER.into()),
        ("api-audiences", SERVICE_ACCOUNT_ISSUER.into()),
        ("service-account-signing-key-file", sa_key.clone()),
        ("service-account-key-file", sa_key),
        ("service-cluster-ip-range", DEFAULT_SERVICE_CIDR.into()),
        ("allow-privileged", "true".into()),
        ("authorization-mode", "Node,RBAC".into()),
        ("enable-admission-plugins", ENABLED_ADMISSION_PLUGINS.into()),
        ("disable-admission-plugins", DISABLED_ADMISSION_PLUGINS.join(",")),
        ("max-requests-inflight", "50".into()),
        ("max-mutating-requests-inflight", "25".into()),
        ("etcd-compaction-interval", "30m".into()),
        ("etcd-count-metric-poll-period", "1m".into()),
        ("min-request-timeout", "30".into()),
        ("request-timeout", "300s".into()),
        ("watch-cache", "false".into()),
        ("event-ttl", "1h".into()),
        ("enable-bootstrap-token-auth", "false".into()),
        ("enable-garbage-collector", "false".into()),
        ("profiling", "false".into()),
        ("audit-log-path", "-".into()),
        ("audit-log-maxage", "0".into()),
        ("audit-log-maxbackup", "0".into()),
        ("audit-log-maxsize", "0".into()),
    ];

    flags
        .into_iter()
        .map(|(flag, value)| format!("--{}={}", flag, value))
        .collect()
}

/// kube-apiserver as a chain service
pub struct ApiServer {
    paths: Paths,
    node_name: String,
    binary: PathBuf,
    applier: Arc<dyn ClusterApplier>,
}

impl ApiServer {
    /// Adapter running the bundle's `kube-apiserver`
    pub fn new(config: &Config, bundle: &Bundle, applier: Arc<dyn ClusterApplier>) -> Self {
        Self {
            paths: config.paths.clone(),
            node_name: config.node_name.clone(),
            binary: bundle.binary("kube-apiserver"),
            applier,
        }
    }

    /// Best-effort steps once the API server answers
    async fn post_setup(&self) {
        if let Err(e) = kubeconfig::write_admin_kubeconfig(&self.paths) {
            warn!(component = NAME, error = %e, "Failed to write admin kubeconfig");
        }

        match rbac::apiserver_manifests() {
            Ok(manifests) => {
                if let Err(e) = apply_all(self.applier.as_ref(), &manifests).await {
                    warn!(component = NAME, error = %e, "Failed to apply API server RBAC");
                }
            }
            Err(e) => warn!(component = NAME, error = %e, "Failed to render API server RBAC"),
        }

        match webhook::registration_manifest(&self.paths.webhook) {
            Ok(manifest) => {
                if let Err(e) = self.applier.apply(&manifest).await {
                    warn!(component = NAME, error = %e, "Failed to register webhook");
                }
            }
            Err(e) => warn!(component = NAME, error = %e, "Failed to render webhook registration"),
        }
    }

    async fn confirm(&self, cancel: &CancellationToken) -> Result<()> {
        HealthProbe::insecure_https(NAME, HEALTH_URL)?
            .wait_healthy(cancel)
            .await?;
        self.post_setup().await;
        Ok(())
    }
}

#[async_trait]
impl Service for ApiServer {
    async fn run(&self, cancel: CancellationToken, ready: ReadinessNotifier) -> Result<()> {
        if pki::ensure_service_account_key(&self.paths.service_account_key)? {
            info!(component = NAME, "Service account key created");
        }
        webhook::start(&self.node_name, &self.paths.webhook, cancel.clone()).await?;

        let spec = ProcessSpec::new(NAME, &self.binary).args(args(&self.paths, network::node_ip()));
        let probe_cancel = cancel.clone();
        run_component(spec, cancel, ready, || async move {
            self.confirm(&probe_cancel).await
        })
        .await
    }
}
