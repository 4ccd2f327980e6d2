//! Cluster add-ons
//!
//! Add-ons are plain sets of typed Kubernetes objects, applied in order through a
//! [`ClusterApplier`] once the whole service chain is ready:
//! - **CoreDNS**: cluster DNS on the fixed service IP, always deployed
//! - **Edge agent**: Portainer edge agent, deployed only with edge credentials

pub mod coredns;
pub mod edge_agent;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::kube_client::{apply_all, ClusterApplier};
use crate::orchestrator::AddonDeployer;
use crate::Result;

/// An add-on made of pre-rendered manifests
pub struct ManifestAddon {
    name: &'static str,
    manifests: Vec<Value>,
    applier: Arc<dyn ClusterApplier>,
}

impl ManifestAddon {
    /// Add-on applying `manifests` through `applier`
    pub fn new(
        name: &'static str,
        manifests: Vec<Value>,
        applier: Arc<dyn ClusterApplier>,
    ) -> Self {
        Self {
            name,
            manifests,
            applier,
        }
    }

    /// Rendered manifests, in apply order
    pub fn manifests(&self) -> &[Value] {
        &self.manifests
    }
}

#[async_trait]
impl AddonDeployer for ManifestAddon {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn deploy(&self) -> Result<()> {
        apply_all(self.applier.as_ref(), &self.manifests).await
    }
}

/// Add-ons for this node, in deployment order
pub fn for_config(
    config: &Config,
    applier: Arc<dyn ClusterApplier>,
) -> Result<Vec<Arc<dyn AddonDeployer>>> {
    let mut addons: Vec<Arc<dyn AddonDeployer>> = vec![Arc::new(ManifestAddon::new(
        "coredns",
        coredns::manifests()?,
        applier.clone(),
    ))];

    if config.edge.is_enabled() {
        addons.push(Arc::new(ManifestAddon::new(
            "edge-agent",
            edge_agent::manifests(&config.edge)?,
            applier,
        )));
    }

    Ok(addons)
}
