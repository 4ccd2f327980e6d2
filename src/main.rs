//! edgekube - single-node Kubernetes for edge devices

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use edgekube::config::{self, Config, EdgeAgentConfig, Paths, SystemPaths};
use edgekube::kube_client::KubeApplier;
use edgekube::orchestrator::{self, Orchestrator, RunOutcome};
use edgekube::telemetry::{self, LogFormat, TelemetryConfig};
use edgekube::{addons, diagnostics, services};

/// edgekube - bring up a complete single-node cluster from a local bundle
#[derive(Parser, Debug)]
#[command(name = "edgekube", version, about, long_about = None)]
struct Cli {
    /// Base directory for certificates, configs and component state
    #[arg(long, env = "EDGEKUBE_PATH", default_value = edgekube::DEFAULT_BASE_PATH)]
    path: PathBuf,

    /// Directory holding component binaries, CNI plugins and image archives
    #[arg(long, env = "EDGEKUBE_BUNDLE", default_value = edgekube::DEFAULT_BUNDLE_PATH)]
    bundle: PathBuf,

    /// Portainer edge ID; the edge agent is deployed when both ID and key are set
    #[arg(long, env = "EDGEKUBE_PORTAINER_EDGE_ID", default_value = "")]
    portainer_edge_id: String,

    /// Portainer edge key
    #[arg(long, env = "EDGEKUBE_PORTAINER_EDGE_KEY", default_value = "", hide_env_values = true)]
    portainer_edge_key: String,

    /// Debug-level logging
    #[arg(long, env = "EDGEKUBE_DEBUG")]
    debug: bool,

    /// Serve the diagnostics endpoint on 127.0.0.1
    #[arg(long, env = "EDGEKUBE_PPROF_SERVER")]
    pprof_server: bool,

    /// Log output format: pretty or json
    #[arg(long, env = "EDGEKUBE_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            paths: Paths::new(self.path),
            system: SystemPaths::default(),
            bundle_dir: self.bundle,
            node_name: config::node_name(),
            edge: EdgeAgentConfig {
                edge_id: self.portainer_edge_id,
                edge_key: self.portainer_edge_key,
            },
            diagnostics: self.pprof_server,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    telemetry::init(&TelemetryConfig {
        debug: cli.debug,
        format: cli.log_format,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = cli.into_config();
    tracing::info!(
        node = %config.node_name,
        path = %config.paths.base.display(),
        bundle = %config.bundle_dir.display(),
        edge_agent = config.edge.is_enabled(),
        "Starting edgekube"
    );

    orchestrator::bootstrap(&config).map_err(|e| anyhow::anyhow!("Failed to bootstrap: {}", e))?;

    let cancel = CancellationToken::new();
    let applier = Arc::new(KubeApplier::new(&config.paths.admin_kubeconfig));
    let addons = addons::for_config(&config, applier.clone())
        .map_err(|e| anyhow::anyhow!("Failed to prepare add-ons: {}", e))?;

    let orchestrator = Orchestrator::new(services::chain(&config, applier), cancel.clone())
        .with_addons(addons);

    if config.diagnostics {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, edgekube::DEFAULT_DIAGNOSTICS_PORT));
        let status = orchestrator.status();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = diagnostics::serve(addr, status, cancel).await {
                tracing::warn!(error = %e, "Diagnostics server stopped");
            }
        });
    }

    let outcome = orchestrator
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Node shut down after add-on failure: {}", e))?;

    match &outcome {
        RunOutcome::Stopped => tracing::info!("edgekube stopped"),
        RunOutcome::Cancelled { service } => {
            tracing::info!(service, "Startup interrupted by shutdown")
        }
        RunOutcome::Aborted { service, reason } | RunOutcome::Failed { service, reason } => {
            tracing::error!(service, reason = %reason, "edgekube exiting after service failure")
        }
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
