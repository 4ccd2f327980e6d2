//! Node-name mutating admission webhook
//!
//! Pods created without `spec.nodeName` are pinned to this node at admission, so
//! they bypass scheduling entirely. The server runs next to the API server on
//! [`DEFAULT_WEBHOOK_PORT`] with the webhook certificate.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{DynamicObject, ObjectMeta};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CertPaths;
use crate::kube_client::to_manifest;
use crate::{Error, Result, DEFAULT_WEBHOOK_NAME, DEFAULT_WEBHOOK_PORT};

/// URL the API server calls
pub fn webhook_url() -> String {
    format!("https://127.0.0.1:{}/mutate", DEFAULT_WEBHOOK_PORT)
}

/// Time in-flight admission requests get when the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state for the mutate handler
#[derive(Debug, Clone)]
pub struct WebhookState {
    /// Node every unscheduled pod is assigned to
    pub node_name: String,
}

/// Router serving `POST /mutate`
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .with_state(state)
}

async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate(&state.node_name, &request).into_review())
}

/// Admission decision for one request
///
/// Always allows. Pods without a node name get a JSON patch adding
/// `/spec/nodeName`; everything else passes unchanged.
pub fn mutate(node_name: &str, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if request.kind.kind != "Pod" {
        return response;
    }
    let Some(pod) = &request.object else {
        return response;
    };

    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let assigned = pod
        .data
        .pointer("/spec/nodeName")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty());
    if let Some(node) = assigned {
        debug!(pod = pod_name, node, "Pod already has a node name");
        return response;
    }

    info!(
        pod = pod_name,
        namespace = ?request.namespace,
        node = node_name,
        "Setting node name for pod"
    );
    let patch = json_patch::Patch(vec![json_patch::PatchOperation::Add(
        json_patch::AddOperation {
            path: jsonptr::PointerBuf::from_tokens(["spec", "nodeName"]),
            value: Value::String(node_name.to_string()),
        },
    )]);

    match response.with_patch(patch) {
        Ok(patched) => patched,
        Err(e) => {
            error!(error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request)
        }
    }
}

/// Start the HTTPS server in the background
///
/// Returns once the TLS material is loaded; the server stops when `cancel` fires.
pub async fn start(node_name: &str, certs: &CertPaths, cancel: CancellationToken) -> Result<()> {
    let cert = std::fs::read(&certs.cert).map_err(|e| {
        Error::filesystem(format!("failed to read {}: {}", certs.cert.display(), e))
    })?;
    let key = std::fs::read(&certs.key).map_err(|e| {
        Error::filesystem(format!("failed to read {}: {}", certs.key.display(), e))
    })?;
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert, key)
        .await
        .map_err(|e| Error::config(format!("webhook TLS config error: {}", e)))?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_WEBHOOK_PORT));
    let app = webhook_router(Arc::new(WebhookState {
        node_name: node_name.to_string(),
    }));

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(%addr, "Starting webhook server");
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            error!(error = %e, "Webhook server error");
        }
    });

    Ok(())
}

/// MutatingWebhookConfiguration pointing the API server at this webhook
pub fn registration(ca_bundle: &[u8]) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(DEFAULT_WEBHOOK_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: DEFAULT_WEBHOOK_NAME.to_string(),
            client_config: WebhookClientConfig {
                url: Some(webhook_url()),
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                ..Default::default()
            },
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec![String::new(), "apps".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                ..Default::default()
            }]),
            failure_policy: Some("Ignore".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(30),
            admission_review_versions: vec!["v1".to_string()],
            reinvocation_policy: Some("IfNeeded".to_string()),
            ..Default::default()
        }]),
    }
}

/// Registration manifest with the webhook certificate as CA bundle
pub fn registration_manifest(certs: &CertPaths) -> Result<Value> {
    let ca_bundle = std::fs::read(&certs.cert).map_err(|e| {
        Error::filesystem(format!("failed to read {}: {}", certs.cert.display(), e))
    })?;
    to_manifest(&registration(&ca_bundle))
}
