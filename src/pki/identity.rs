//! Certificate identities and their issuance policies
//!
//! Every TLS identity inside the node maps to exactly one fixed policy. The
//! policy is a pure function of the identity, the node name and the local
//! addresses, so it can be checked without touching the filesystem.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::config::{CertPaths, Paths};

/// Validity of the root certificate in days (10 years)
pub const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Validity of leaf certificates in days (1 year)
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Key usage bits issued by this CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyUsage {
    /// digitalSignature
    DigitalSignature,
    /// keyEncipherment
    KeyEncipherment,
    /// keyCertSign
    CertSign,
    /// cRLSign
    CrlSign,
}

/// Extended key usages issued by this CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtKeyUsage {
    /// TLS server authentication
    ServerAuth,
    /// TLS client authentication
    ClientAuth,
}

/// Every identity the node issues a certificate for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateIdentity {
    /// Self-signed root that signs every other identity
    Root,
    /// Kubelet serving and client identity
    NodeAgent,
    /// API server serving identity, also used as the kubelet client
    ApiServer,
    /// Controller manager serving identity
    ControllerManager,
    /// Cluster admin user
    AdminUser,
    /// Node-name mutating webhook
    Webhook,
}

impl CertificateIdentity {
    /// All identities in issuance order; the root always comes first
    pub const ALL: [CertificateIdentity; 6] = [
        CertificateIdentity::Root,
        CertificateIdentity::NodeAgent,
        CertificateIdentity::ApiServer,
        CertificateIdentity::ControllerManager,
        CertificateIdentity::AdminUser,
        CertificateIdentity::Webhook,
    ];

    /// Whether this identity signs itself
    pub fn is_root(&self) -> bool {
        matches!(self, CertificateIdentity::Root)
    }

    /// Where this identity's certificate and key live
    pub fn paths<'a>(&self, paths: &'a Paths) -> &'a CertPaths {
        match self {
            CertificateIdentity::Root => &paths.ca,
            CertificateIdentity::NodeAgent => &paths.kubelet,
            CertificateIdentity::ApiServer => &paths.apiserver,
            CertificateIdentity::ControllerManager => &paths.controller_manager,
            CertificateIdentity::AdminUser => &paths.admin,
            CertificateIdentity::Webhook => &paths.webhook,
        }
    }

    /// Resolve the issuance policy for this identity
    pub fn policy(&self, ctx: &PolicyContext) -> IdentityPolicy {
        use ExtKeyUsage::*;
        use KeyUsage::*;

        let leaf_usages = || BTreeSet::from([DigitalSignature, KeyEncipherment]);

        match self {
            CertificateIdentity::Root => IdentityPolicy {
                common_name: "kubernetes-ca".to_string(),
                organization: "Kubernetes".to_string(),
                dns_names: Vec::new(),
                ip_addresses: Vec::new(),
                key_usages: BTreeSet::from([CertSign, CrlSign, DigitalSignature]),
                extended_key_usages: BTreeSet::new(),
                validity_days: ROOT_VALIDITY_DAYS,
                is_ca: true,
            },
            CertificateIdentity::NodeAgent => IdentityPolicy {
                common_name: format!("system:node:{}", ctx.node_name),
                organization: "system:nodes".to_string(),
                dns_names: vec![ctx.node_name.clone(), "localhost".to_string()],
                ip_addresses: ctx.local_ips.clone(),
                key_usages: leaf_usages(),
                extended_key_usages: BTreeSet::from([ClientAuth, ServerAuth]),
                validity_days: LEAF_VALIDITY_DAYS,
                is_ca: false,
            },
            CertificateIdentity::ApiServer => {
                let mut ip_addresses = vec![
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V4(ctx.kubernetes_service_ip),
                ];
                for ip in &ctx.local_ips {
                    if !ip_addresses.contains(ip) {
                        ip_addresses.push(*ip);
                    }
                }
                IdentityPolicy {
                    common_name: "kube-apiserver".to_string(),
                    organization: "Kubernetes".to_string(),
                    dns_names: [
                        "kubernetes",
                        "kubernetes.default",
                        "kubernetes.default.svc",
                        "kubernetes.default.svc.cluster",
                        "kubernetes.default.svc.cluster.local",
                        "localhost",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                    ip_addresses,
                    key_usages: leaf_usages(),
                    extended_key_usages: BTreeSet::from([ServerAuth, ClientAuth]),
                    validity_days: LEAF_VALIDITY_DAYS,
                    is_ca: false,
                }
            }
            CertificateIdentity::ControllerManager => IdentityPolicy {
                common_name: "system:kube-controller-manager".to_string(),
                organization: "system:kube-controller-manager".to_string(),
                dns_names: Vec::new(),
                ip_addresses: Vec::new(),
                key_usages: leaf_usages(),
                extended_key_usages: BTreeSet::from([ClientAuth]),
                validity_days: LEAF_VALIDITY_DAYS,
                is_ca: false,
            },
            CertificateIdentity::AdminUser => IdentityPolicy {
                common_name: "kubesolo-admin".to_string(),
                organization: "system:masters".to_string(),
                dns_names: vec!["localhost".to_string()],
                ip_addresses: ctx.local_ips.clone(),
                key_usages: leaf_usages(),
                extended_key_usages: BTreeSet::from([ClientAuth, ServerAuth]),
                validity_days: LEAF_VALIDITY_DAYS,
                is_ca: false,
            },
            CertificateIdentity::Webhook => IdentityPolicy {
                common_name: "kubesolo-webhook".to_string(),
                organization: "system:masters".to_string(),
                dns_names: [
                    "localhost",
                    "kubesolo-webhook",
                    "kubesolo-webhook.default",
                    "kubesolo-webhook.default.svc",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                key_usages: leaf_usages(),
                extended_key_usages: BTreeSet::from([ServerAuth]),
                validity_days: LEAF_VALIDITY_DAYS,
                is_ca: false,
            },
        }
    }
}

impl fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateIdentity::Root => "ca",
            CertificateIdentity::NodeAgent => "kubelet",
            CertificateIdentity::ApiServer => "apiserver",
            CertificateIdentity::ControllerManager => "controller-manager",
            CertificateIdentity::AdminUser => "admin",
            CertificateIdentity::Webhook => "webhook",
        };
        f.write_str(name)
    }
}

/// Host facts that feed SAN resolution
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// Node name, used for the kubelet identity
    pub node_name: String,
    /// Local IPv4 addresses including `127.0.0.1`
    pub local_ips: Vec<IpAddr>,
    /// Cluster IP of the `kubernetes` service
    pub kubernetes_service_ip: Ipv4Addr,
}

impl PolicyContext {
    /// Context for this host: its local addresses and the default service IP
    pub fn detect(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            local_ips: crate::network::local_ips(),
            kubernetes_service_ip: crate::DEFAULT_KUBERNETES_SERVICE_IP,
        }
    }
}

/// Fixed issuance policy of one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPolicy {
    /// Subject CN
    pub common_name: String,
    /// Subject O
    pub organization: String,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// keyUsage bits
    pub key_usages: BTreeSet<KeyUsage>,
    /// extendedKeyUsage purposes
    pub extended_key_usages: BTreeSet<ExtKeyUsage>,
    /// Lifetime from issuance
    pub validity_days: i64,
    /// Carries the CA basic constraint
    pub is_ca: bool,
}
