//! Diagnostics server
//!
//! Enabled with `--pprof-server`. Serves a liveness endpoint and a JSON view of the
//! orchestrator phase and each service's readiness, on loopback only.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::{OrchestratorState, StatusHandle};
use crate::readiness::ReadinessState;
use crate::{Error, Result};

/// Readiness of one service
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Service name
    pub name: &'static str,
    /// `pending`, `ready` or `failed`
    pub readiness: &'static str,
    /// Failure reason, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of `/debug/services`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    /// Orchestrator phase
    pub phase: String,
    /// Services in chain order
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    /// Snapshot of `status`
    pub fn capture(status: &StatusHandle) -> Self {
        let phase = match status.state() {
            OrchestratorState::Idle => "idle".to_string(),
            OrchestratorState::Sequencing(name) => format!("sequencing:{}", name),
            OrchestratorState::PostSequence => "post-sequence".to_string(),
            OrchestratorState::Steady => "steady".to_string(),
            OrchestratorState::ShuttingDown => "shutting-down".to_string(),
        };

        let services = status
            .services()
            .into_iter()
            .map(|(name, state)| {
                let (readiness, reason) = match state {
                    ReadinessState::Pending => ("pending", None),
                    ReadinessState::Ready => ("ready", None),
                    ReadinessState::Failed(reason) => ("failed", Some(reason)),
                };
                ServiceStatus {
                    name,
                    readiness,
                    reason,
                }
            })
            .collect();

        Self { phase, services }
    }
}

async fn services_handler(State(status): State<StatusHandle>) -> Json<StatusReport> {
    Json(StatusReport::capture(&status))
}

/// Router serving `/healthz` and `/debug/services`
pub fn diagnostics_router(status: StatusHandle) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/debug/services", get(services_handler))
        .with_state(status)
}

/// Serve until `cancel` fires
pub async fn serve(addr: SocketAddr, status: StatusHandle, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind diagnostics on {}: {}", addr, e)))?;

    info!(%addr, "Diagnostics server listening");
    axum::serve(listener, diagnostics_router(status))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| {
            error!(error = %e, "Diagnostics server error");
            Error::Io(e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Orchestrator, ServiceDescriptor, Service};
    use crate::readiness::ReadinessNotifier;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Service for Idle {
        async fn run(&self, cancel: CancellationToken, _ready: ReadinessNotifier) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn status() -> StatusHandle {
        Orchestrator::new(
            vec![
                ServiceDescriptor::new("containerd", Idle),
                ServiceDescriptor::new("kine", Idle),
            ],
            CancellationToken::new(),
        )
        .status()
    }

    #[test]
    fn report_lists_services_in_chain_order() {
        let report = StatusReport::capture(&status());
        assert_eq!(report.phase, "idle");
        let names: Vec<_> = report.services.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["containerd", "kine"]);
        assert!(report.services.iter().all(|s| s.readiness == "pending"));
    }

    #[tokio::test]
    async fn server_answers_and_stops_on_cancel() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(addr, status(), cancel.clone()));

        let client = reqwest::Client::new();
        let mut body = None;
        for _ in 0..50 {
            if let Ok(resp) = client
                .get(format!("http://{}/debug/services", addr))
                .send()
                .await
            {
                body = Some(resp.json::<serde_json::Value>().await.unwrap());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let body = body.expect("diagnostics server never answered");
        assert_eq!(body["services"][0]["name"], "containerd");
        assert_eq!(body["phase"], "idle");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
