//! RBAC objects applied once the API server answers
//!
//! The API server needs to reach the kubelet, the admin user needs cluster-admin,
//! and the node identity needs to manage its own Node object.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::api::ObjectMeta;
use serde_json::Value;

use crate::kube_client::to_manifest;
use crate::kubeconfig::ADMIN_USER;
use crate::Result;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// ClusterRole granting access to kubelet endpoints
pub const APISERVER_TO_KUBELET_ROLE: &str = "system:kube-apiserver-to-kubelet";

/// ClusterRole and binding name for the node identity
pub const NODE_ROLE: &str = "system:node";

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn cluster_role_ref(name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: name.to_string(),
    }
}

fn user(name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_GROUP.to_string()),
        kind: "User".to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

/// Role letting the API server proxy to kubelet subresources
pub fn apiserver_to_kubelet_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(APISERVER_TO_KUBELET_ROLE.to_string()),
            annotations: Some(BTreeMap::from([(
                "rbac.authorization.kubernetes.io/autoupdate".to_string(),
                "true".to_string(),
            )])),
            labels: Some(BTreeMap::from([(
                "kubernetes.io/bootstrapping".to_string(),
                "rbac-defaults".to_string(),
            )])),
            ..Default::default()
        },
        rules: Some(vec![rule(
            &[
                "nodes/proxy",
                "nodes/stats",
                "nodes/log",
                "nodes/spec",
                "nodes/metrics",
                "pods/exec",
                "pods/portforward",
                "pods/log",
                "pods/attach",
            ],
            &["*"],
        )]),
        ..Default::default()
    }
}

/// Binds [`apiserver_to_kubelet_role`] to the API server's client identities
pub fn apiserver_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some("system:kube-apiserver".to_string()),
            ..Default::default()
        },
        role_ref: cluster_role_ref(APISERVER_TO_KUBELET_ROLE),
        subjects: Some(vec![user("kubernetes"), user("kube-apiserver")]),
    }
}

/// Grants cluster-admin to the admin certificate user
pub fn admin_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-cluster-admin", ADMIN_USER)),
            ..Default::default()
        },
        role_ref: cluster_role_ref("cluster-admin"),
        subjects: Some(vec![user(ADMIN_USER)]),
    }
}

/// Role for the kubelet to read nodes and update its own status
pub fn node_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(NODE_ROLE.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(&["nodes"], &["get", "list", "watch"]),
            rule(&["nodes/status"], &["patch", "update"]),
            rule(&["nodes/proxy"], &["*"]),
        ]),
        ..Default::default()
    }
}

/// Binds [`node_role`] to `system:node:<node_name>`
pub fn node_binding(node_name: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(NODE_ROLE.to_string()),
            ..Default::default()
        },
        role_ref: cluster_role_ref(NODE_ROLE),
        subjects: Some(vec![user(&format!("system:node:{}", node_name))]),
    }
}

/// Objects applied after the API server becomes healthy
pub fn apiserver_manifests() -> Result<Vec<Value>> {
    Ok(vec![
        to_manifest(&apiserver_to_kubelet_role())?,
        to_manifest(&apiserver_binding())?,
        to_manifest(&admin_binding())?,
    ])
}

/// Objects applied before the kubelet starts
pub fn node_manifests(node_name: &str) -> Result<Vec<Value>> {
    Ok(vec![
        to_manifest(&node_role())?,
        to_manifest(&node_binding(node_name))?,
    ])
}
