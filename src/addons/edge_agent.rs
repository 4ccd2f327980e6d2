//! Portainer edge agent add-on

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource,
    Namespace, ObjectFieldSelector, PodSpec, PodTemplateSpec, Secret, SecretKeySelector, Service,
    ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::Value;

use crate::config::EdgeAgentConfig;
use crate::kube_client::to_manifest;
use crate::{Result, DEFAULT_EDGE_AGENT_IMAGE};

const NAMESPACE: &str = "portainer";
const NAME: &str = "portainer-agent";
const CONFIG_MAP: &str = "portainer-agent-edge";
const SECRET: &str = "portainer-agent-edge-key";
const SECRET_KEY: &str = "edge.key";
const SERVICE_ACCOUNT: &str = "portainer-sa-clusteradmin";
const CLUSTER_ROLE_BINDING: &str = "portainer-crb-clusteradmin";

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), NAME.to_string())])
}

fn namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn config_map(edge: &EdgeAgentConfig) -> ConfigMap {
    ConfigMap {
        metadata: meta(CONFIG_MAP),
        data: Some(BTreeMap::from([
            ("EDGE_ID".to_string(), edge.edge_id.clone()),
            ("EDGE_INSECURE_POLL".to_string(), "true".to_string()),
        ])),
        ..Default::default()
    }
}

fn secret(edge: &EdgeAgentConfig) -> Secret {
    Secret {
        metadata: meta(SECRET),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            SECRET_KEY.to_string(),
            edge.edge_key.clone(),
        )])),
        ..Default::default()
    }
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: meta(SERVICE_ACCOUNT),
        ..Default::default()
    }
}

fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn headless_service() -> Service {
    let service_port = |name: &str, port: i32| ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    Service {
        metadata: meta(NAME),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(app_labels()),
            ports: Some(vec![service_port("edge", 9001), service_port("http", 80)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env() -> Vec<EnvVar> {
    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };

    vec![
        plain("LOG_LEVEL", "INFO"),
        plain("EDGE", "1"),
        plain("AGENT_CLUSTER_ADDR", NAME),
        EnvVar {
            name: "KUBERNETES_POD_IP".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "EDGE_KEY".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: SECRET.to_string(),
                    key: SECRET_KEY.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn deployment() -> Deployment {
    let container_port = |port: i32| ContainerPort {
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    Deployment {
        metadata: meta(NAME),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    containers: vec![Container {
                        name: NAME.to_string(),
                        image: Some(DEFAULT_EDGE_AGENT_IMAGE.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        env: Some(env()),
                        env_from: Some(vec![EnvFromSource {
                            config_map_ref: Some(ConfigMapEnvSource {
                                name: CONFIG_MAP.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ports: Some(vec![container_port(9001), container_port(80)]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Edge agent objects in apply order
pub fn manifests(edge: &EdgeAgentConfig) -> Result<Vec<Value>> {
    Ok(vec![
        to_manifest(&namespace())?,
        to_manifest(&config_map(edge))?,
        to_manifest(&secret(edge))?,
        to_manifest(&service_account())?,
        to_manifest(&cluster_role_binding())?,
        to_manifest(&headless_service())?,
        to_manifest(&deployment())?,
    ])
}
