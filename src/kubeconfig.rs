//! Kubeconfig rendering
//!
//! The admin kubeconfig embeds the CA and admin credentials so it can be copied off
//! the node as-is. The kubelet kubeconfig references its files by path instead.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::info;

use crate::config::Paths;
use crate::filesystem::{self, MODE_PRIVATE};
use crate::{Error, Result, DEFAULT_API_SERVER_ADDRESS};

/// Cluster entry name in the admin kubeconfig
pub const ADMIN_CLUSTER_NAME: &str = "kubesolo";

/// Certificate-authenticated admin user
pub const ADMIN_USER: &str = "kubernetes-admin";

/// Token-authenticated admin user
pub const ADMIN_TOKEN_USER: &str = "admin-token";

/// Cluster entry name in the kubelet kubeconfig
pub const KUBELET_CLUSTER_NAME: &str = "kubernetes";

/// PEM material embedded into the admin kubeconfig
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    /// CA certificate
    pub ca_pem: Vec<u8>,
    /// Admin client certificate
    pub cert_pem: Vec<u8>,
    /// Admin client key
    pub key_pem: Vec<u8>,
}

impl AdminCredentials {
    /// Read the CA and admin pair from their issued locations
    pub fn load(paths: &Paths) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                Error::filesystem(format!(
                    "required certificate file {} unreadable: {}",
                    path.display(),
                    e
                ))
            })
        };
        Ok(Self {
            ca_pem: read(&paths.ca.cert)?,
            cert_pem: read(&paths.admin.cert)?,
            key_pem: read(&paths.admin.key)?,
        })
    }
}

/// Admin kubeconfig with an embedded certificate user and a token user
pub fn admin_kubeconfig(server: &str, creds: &AdminCredentials) -> Value {
    let context = format!("{}@{}", ADMIN_USER, ADMIN_CLUSTER_NAME);
    let token_context = format!("{}@{}", ADMIN_TOKEN_USER, ADMIN_CLUSTER_NAME);

    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": ADMIN_CLUSTER_NAME,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(&creds.ca_pem),
            }
        }],
        "users": [
            {
                "name": ADMIN_USER,
                "user": {
                    "client-certificate-data": STANDARD.encode(&creds.cert_pem),
                    "client-key-data": STANDARD.encode(&creds.key_pem),
                }
            },
            {
                "name": ADMIN_TOKEN_USER,
                "user": { "token": ADMIN_TOKEN_USER }
            }
        ],
        "contexts": [
            {
                "name": context,
                "context": { "cluster": ADMIN_CLUSTER_NAME, "user": ADMIN_USER }
            },
            {
                "name": token_context,
                "context": { "cluster": ADMIN_CLUSTER_NAME, "user": ADMIN_TOKEN_USER }
            }
        ],
        "current-context": context,
        "preferences": {},
    })
}

/// Kubelet kubeconfig pointing at the CA and node certificate files
pub fn kubelet_kubeconfig(server: &str, node_name: &str, paths: &Paths) -> Value {
    let user = format!("system:node:{}", node_name);
    let context = format!("{}@{}", user, KUBELET_CLUSTER_NAME);

    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": KUBELET_CLUSTER_NAME,
            "cluster": {
                "server": server,
                "certificate-authority": paths.ca.cert.display().to_string(),
            }
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate": paths.kubelet.cert.display().to_string(),
                "client-key": paths.kubelet.key.display().to_string(),
            }
        }],
        "contexts": [{
            "name": context,
            "context": { "cluster": KUBELET_CLUSTER_NAME, "user": user }
        }],
        "current-context": context,
    })
}

fn write_yaml(path: &Path, value: &Value) -> Result<()> {
    let yaml = serde_yaml::to_string(value)
        .map_err(|e| Error::serialization(format!("failed to encode kubeconfig: {}", e)))?;
    filesystem::write_file(path, yaml.as_bytes(), MODE_PRIVATE)
}

/// Write the admin kubeconfig from the issued certificates
pub fn write_admin_kubeconfig(paths: &Paths) -> Result<()> {
    let creds = AdminCredentials::load(paths)?;
    write_yaml(
        &paths.admin_kubeconfig,
        &admin_kubeconfig(DEFAULT_API_SERVER_ADDRESS, &creds),
    )?;
    info!(path = %paths.admin_kubeconfig.display(), "Admin kubeconfig written");
    Ok(())
}

/// Write the kubelet kubeconfig
pub fn write_kubelet_kubeconfig(paths: &Paths, node_name: &str) -> Result<()> {
    write_yaml(
        &paths.kubelet_kubeconfig,
        &kubelet_kubeconfig(DEFAULT_API_SERVER_ADDRESS, node_name, paths),
    )
}
