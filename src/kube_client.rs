//! Cluster client and server-side apply
//!
//! Post-setup steps and add-ons talk to the API server through one seam,
//! [`ClusterApplier`], so they can be tested without a cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{Error, Result, FIELD_MANAGER};

/// Connection timeout for the local API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for API requests
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client from a kubeconfig file
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!("failed to read kubeconfig {}: {}", path.display(), e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

/// Serialize a typed Kubernetes object into an apply-ready manifest
pub fn to_manifest<T: Serialize>(object: &T) -> Result<Value> {
    serde_json::to_value(object)
        .map_err(|e| Error::serialization(format!("failed to encode manifest: {}", e)))
}

/// Identity of a manifest: kind, name, optional namespace and group/version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    /// apiVersion split into group and version
    pub gvk: GroupVersionKind,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ManifestRef {
    /// Extract the identity fields of `manifest`
    pub fn from_manifest(manifest: &Value) -> Result<Self> {
        let field = |pointer: &str| manifest.pointer(pointer).and_then(|v| v.as_str());

        let kind = field("/kind").ok_or_else(|| Error::serialization("manifest missing kind"))?;
        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::serialization("manifest missing metadata.name"))?;

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Ok(Self {
            gvk: GroupVersionKind {
                group,
                version,
                kind: kind.to_string(),
            },
            name: name.to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
        })
    }
}

/// Creates or updates cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    /// Server-side apply one manifest
    async fn apply(&self, manifest: &Value) -> Result<()>;
}

/// Apply every manifest in order, stopping at the first failure
pub async fn apply_all(applier: &dyn ClusterApplier, manifests: &[Value]) -> Result<()> {
    for manifest in manifests {
        applier.apply(manifest).await?;
    }
    Ok(())
}

/// [`ClusterApplier`] backed by the admin kubeconfig
///
/// The client is built on first use, because the kubeconfig only appears once the
/// API server is up.
pub struct KubeApplier {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
}

impl KubeApplier {
    /// Applier connecting with `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| client_from_kubeconfig(&self.kubeconfig))
            .await
    }
}

#[async_trait]
impl ClusterApplier for KubeApplier {
    async fn apply(&self, manifest: &Value) -> Result<()> {
        let target = ManifestRef::from_manifest(manifest)?;
        let client = self.client().await?.clone();
        let resource = ApiResource::from_gvk(&target.gvk);

        let api: Api<DynamicObject> = match &target.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&target.name, &params, &Patch::Apply(manifest))
            .await?;

        debug!(kind = %target.gvk.kind, name = %target.name, "Applied manifest");
        Ok(())
    }
}
