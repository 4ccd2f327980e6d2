//! Service adapters for the external components
//!
//! Each adapter prepares the files its component reads, runs the component from
//! the bundle as a supervised child, confirms it is serving and only then fires
//! its readiness signal. The chain order is fixed:
//!
//! containerd → kine → apiserver → controller-manager → kubelet → kube-proxy

pub mod apiserver;
pub mod containerd;
pub mod controller_manager;
pub mod kine;
pub mod kube_proxy;
pub mod kubelet;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bundle::Bundle;
use crate::config::Config;
use crate::kube_client::ClusterApplier;
use crate::orchestrator::ServiceDescriptor;
use crate::process::{ProcessSpec, SupervisedProcess, TERMINATION_GRACE};
use crate::readiness::ReadinessNotifier;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// The full service chain in start order
pub fn chain(config: &Config, applier: Arc<dyn ClusterApplier>) -> Vec<ServiceDescriptor> {
    let bundle = Bundle::new(&config.bundle_dir);

    vec![
        ServiceDescriptor::new(
            containerd::NAME,
            containerd::Containerd::new(config, bundle.clone()),
        ),
        ServiceDescriptor::new(kine::NAME, kine::Kine::new(&config.paths, &bundle)),
        ServiceDescriptor::new(
            apiserver::NAME,
            apiserver::ApiServer::new(config, &bundle, applier.clone()),
        ),
        ServiceDescriptor::new(
            controller_manager::NAME,
            controller_manager::ControllerManager::new(&config.paths, &bundle),
        ),
        ServiceDescriptor::new(
            kubelet::NAME,
            kubelet::Kubelet::new(config, &bundle, applier),
        ),
        ServiceDescriptor::new(kube_proxy::NAME, kube_proxy::KubeProxy::new(&config.paths, &bundle)),
    ]
}

/// Run a component until cancellation, firing `ready` once `confirm` succeeds
///
/// `confirm` races the process: an exit before it completes is an error, and so is
/// a failed confirmation, after which the process is terminated. Cancellation at
/// any point terminates the process and returns `Ok`.
pub(crate) async fn run_component<F, Fut>(
    spec: ProcessSpec,
    cancel: CancellationToken,
    ready: ReadinessNotifier,
    confirm: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut process = SupervisedProcess::spawn(&spec)?;

    let confirmed = tokio::select! {
        res = confirm() => res,
        status = process.wait() => Err(Error::process(format!(
            "{} exited before becoming ready with {}",
            spec.component,
            status?
        ))),
        _ = cancel.cancelled() => {
            debug!(component = spec.component, "Cancelled during startup");
            return process.terminate(TERMINATION_GRACE).await;
        }
    };

    if let Err(e) = confirmed {
        // Exit status is irrelevant here, the confirmation error is what gets reported
        let _ = process.terminate(TERMINATION_GRACE).await;
        return Err(e);
    }

    info!(component = spec.component, pid = process.pid(), "Component ready");
    ready.ready();
    process.supervise(&cancel).await
}

/// Wait until a TCP listener accepts connections
pub async fn wait_for_tcp(addr: &str, attempts: u32, interval: Duration) -> Result<()> {
    retry_with_backoff(&RetryConfig::fixed(attempts, interval), addr, || async {
        tokio::net::TcpStream::connect(addr)
            .await
            .map(drop)
            .map_err(|e| Error::health(format!("{} not accepting connections: {}", addr, e)))
    })
    .await
}

/// Wait until a unix socket accepts connections
pub async fn wait_for_unix_socket(path: &Path, attempts: u32, interval: Duration) -> Result<()> {
    let name = path.display().to_string();
    retry_with_backoff(&RetryConfig::fixed(attempts, interval), &name, || async {
        tokio::net::UnixStream::connect(path)
            .await
            .map(drop)
            .map_err(|e| Error::health(format!("{} not accepting connections: {}", name, e)))
    })
    .await
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
