//! CoreDNS add-on
//!
//! Typed k8s_openapi objects for cluster DNS in `kube-system`, served on the
//! fixed cluster IP the kubelet hands to every pod.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::Value;

use crate::kube_client::to_manifest;
use crate::{Result, DEFAULT_COREDNS_IMAGE, DEFAULT_COREDNS_IP};

const NAMESPACE: &str = "kube-system";
const NAME: &str = "coredns";
const SERVICE_NAME: &str = "kube-dns";
const CLUSTER_ROLE: &str = "system:coredns";

/// Corefile served from the `coredns` ConfigMap
pub const COREFILE: &str = r#".:53 {
    errors
    health :8080
    ready :8181
    cache 30
    kubernetes cluster.local in-addr.arpa ip6.arpa {
        pods insecure
        endpoint_pod_names
        ttl 30
    }
    forward . 1.1.1.1 8.8.8.8
}"#;

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("k8s-app".to_string(), NAME.to_string()),
        ("kubernetes.io/name".to_string(), "CoreDNS".to_string()),
    ])
}

fn selector() -> BTreeMap<String, String> {
    BTreeMap::from([("k8s-app".to_string(), NAME.to_string())])
}

fn config_map() -> ConfigMap {
    ConfigMap {
        metadata: meta(NAME),
        data: Some(BTreeMap::from([(
            "Corefile".to_string(),
            COREFILE.to_string(),
        )])),
        ..Default::default()
    }
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: meta(NAME),
        ..Default::default()
    }
}

fn cluster_role() -> ClusterRole {
    let list_watch = vec!["list".to_string(), "watch".to_string()];
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec![
                    "endpoints".to_string(),
                    "services".to_string(),
                    "pods".to_string(),
                    "namespaces".to_string(),
                ]),
                verbs: list_watch.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                resources: Some(vec!["endpointslices".to_string()]),
                verbs: list_watch,
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: NAME.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn http_probe(path: &str, port: i32, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(5),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn port(name: &str, port: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

fn deployment() -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            labels: Some(app_labels()),
            ..meta(NAME)
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            selector: LabelSelector {
                match_labels: Some(selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    service_account_name: Some(NAME.to_string()),
                    containers: vec![Container {
                        name: NAME.to_string(),
                        image: Some(DEFAULT_COREDNS_IMAGE.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(vec!["-conf".to_string(), "/etc/coredns/Corefile".to_string()]),
                        resources: Some(ResourceRequirements {
                            limits: Some(BTreeMap::from([(
                                "memory".to_string(),
                                Quantity("28Mi".to_string()),
                            )])),
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("50m".to_string())),
                                ("memory".to_string(), Quantity("20Mi".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "config-volume".to_string(),
                            mount_path: "/etc/coredns".to_string(),
                            ..Default::default()
                        }]),
                        ports: Some(vec![
                            port("dns", 53, "UDP"),
                            port("dns-tcp", 53, "TCP"),
                            port("metrics", 8080, "TCP"),
                        ]),
                        liveness_probe: Some(http_probe("/health", 8080, 60)),
                        readiness_probe: Some(http_probe("/ready", 8181, 10)),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "config-volume".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: NAME.to_string(),
                            items: Some(vec![KeyToPath {
                                key: "Corefile".to_string(),
                                path: "Corefile".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service() -> Service {
    let service_port = |name: &str, protocol: &str| ServicePort {
        name: Some(name.to_string()),
        port: 53,
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };

    Service {
        metadata: ObjectMeta {
            labels: Some(app_labels()),
            ..meta(SERVICE_NAME)
        },
        spec: Some(ServiceSpec {
            selector: Some(selector()),
            cluster_ip: Some(DEFAULT_COREDNS_IP.to_string()),
            ports: Some(vec![service_port("dns", "UDP"), service_port("dns-tcp", "TCP")]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CoreDNS objects in apply order
pub fn manifests() -> Result<Vec<Value>> {
    Ok(vec![
        to_manifest(&config_map())?,
        to_manifest(&service_account())?,
        to_manifest(&cluster_role())?,
        to_manifest(&cluster_role_binding())?,
        to_manifest(&deployment())?,
        to_manifest(&service())?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_uses_fixed_cluster_ip() {
        let svc = service();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.43.0.10"));
        assert_eq!(svc.metadata.name.as_deref(), Some("kube-dns"));
        assert_eq!(spec.ports.unwrap().len(), 2);
    }

    #[test]
    fn corefile_serves_health_and_readiness_ports() {
        assert!(COREFILE.contains("health :8080"));
        assert!(COREFILE.contains("ready :8181"));
        assert!(COREFILE.contains("kubernetes cluster.local"));
    }

    #[test]
    fn deployment_mounts_corefile() {
        let dep = deployment();
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_COREDNS_IMAGE));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["-conf".to_string(), "/etc/coredns/Corefile".to_string()]
        );
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "coredns");
    }

    #[test]
    fn manifests_are_ordered_dependencies_first() {
        let kinds: Vec<_> = manifests()
            .unwrap()
            .iter()
            .map(|m| m["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "ConfigMap",
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Deployment",
                "Service"
            ]
        );
    }

    #[test]
    fn namespaced_objects_live_in_kube_system() {
        for manifest in manifests().unwrap() {
            if let Some(ns) = manifest["metadata"].get("namespace") {
                assert_eq!(ns, "kube-system");
            }
        }
    }
}
