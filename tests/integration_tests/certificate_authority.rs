//! End-to-end certificate authority scenarios

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;

use edgekube::config::Paths;
use edgekube::pki::{
    self, CertificateIdentity, CertificateInfo, ExtKeyUsage, PolicyContext, LEAF_VALIDITY_DAYS,
    ROOT_VALIDITY_DAYS,
};

const DAY: i64 = 24 * 60 * 60;

fn context() -> PolicyContext {
    PolicyContext {
        node_name: "edge-01".to_string(),
        local_ips: vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
        ],
        kubernetes_service_ip: Ipv4Addr::new(10, 43, 0, 1),
    }
}

fn read(path: &std::path::Path) -> String {
    fs::read_to_string(path).unwrap()
}

/// Story: a fresh node gets six identities, every leaf signed by the root
#[test]
fn story_fresh_node_issues_every_identity() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());

    pki::issue_all(&paths, &context()).unwrap();

    let ca_pem = read(&paths.ca.cert);
    let ca = CertificateInfo::from_pem(&ca_pem).unwrap();
    assert!(ca.is_ca);
    assert_eq!(ca.common_name, "kubernetes-ca");
    assert_eq!(ca.lifetime_secs(), ROOT_VALIDITY_DAYS * DAY);

    for identity in CertificateIdentity::ALL.iter().filter(|i| !i.is_root()) {
        let certs = identity.paths(&paths);
        let pem = read(&certs.cert);
        pki::verify_signed_by(&pem, &ca_pem)
            .unwrap_or_else(|e| panic!("{} not signed by root: {}", identity, e));

        let info = CertificateInfo::from_pem(&pem).unwrap();
        assert!(!info.is_ca, "{} must not be a CA", identity);
        assert_eq!(info.lifetime_secs(), LEAF_VALIDITY_DAYS * DAY, "{}", identity);

        let mode = fs::metadata(&certs.key).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "{} key mode", identity);
    }
}

/// Story: the API server certificate is valid for every name pods use
#[test]
fn story_apiserver_reachable_under_cluster_names() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());
    pki::issue_all(&paths, &context()).unwrap();

    let info = CertificateInfo::from_pem(&read(&paths.apiserver.cert)).unwrap();
    for name in [
        "kubernetes",
        "kubernetes.default",
        "kubernetes.default.svc",
        "kubernetes.default.svc.cluster.local",
        "localhost",
    ] {
        assert!(info.dns_names.iter().any(|d| d == name), "missing SAN {}", name);
    }
    for ip in [
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::new(10, 43, 0, 1),
        Ipv4Addr::new(192, 168, 1, 20),
    ] {
        assert!(info.ip_addresses.contains(&IpAddr::V4(ip)), "missing IP {}", ip);
    }
    assert!(info.extended_key_usages.contains(&ExtKeyUsage::ServerAuth));
}

/// Story: the kubelet authenticates as its node
#[test]
fn story_kubelet_identity_names_the_node() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());
    pki::issue_all(&paths, &context()).unwrap();

    let info = CertificateInfo::from_pem(&read(&paths.kubelet.cert)).unwrap();
    assert_eq!(info.common_name, "system:node:edge-01");
    assert_eq!(info.organization, "system:nodes");
    assert!(info.dns_names.contains(&"edge-01".to_string()));
    assert!(info.extended_key_usages.contains(&ExtKeyUsage::ClientAuth));
}

/// Story: a restart reuses every certificate and key byte for byte
#[test]
fn story_restart_reuses_existing_material() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());
    pki::issue_all(&paths, &context()).unwrap();

    let before: Vec<_> = paths
        .all_certs()
        .iter()
        .map(|c| (read(&c.cert), read(&c.key)))
        .collect();

    pki::issue_all(&paths, &context()).unwrap();

    let after: Vec<_> = paths
        .all_certs()
        .iter()
        .map(|c| (read(&c.cert), read(&c.key)))
        .collect();
    assert_eq!(before, after);
}

/// Story: a deleted leaf is re-issued under the existing root
#[test]
fn story_missing_leaf_is_reissued_under_same_root() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());
    pki::issue_all(&paths, &context()).unwrap();
    let ca_pem = read(&paths.ca.cert);

    fs::remove_file(&paths.webhook.key).unwrap();
    pki::issue_all(&paths, &context()).unwrap();

    assert_eq!(read(&paths.ca.cert), ca_pem);
    pki::verify_signed_by(&read(&paths.webhook.cert), &ca_pem).unwrap();
}

/// Story: the service account key is created once and then kept
#[test]
fn story_service_account_key_is_stable() {
    let tmp = TempDir::new().unwrap();
    let paths = Paths::new(tmp.path());

    assert!(pki::ensure_service_account_key(&paths.service_account_key).unwrap());
    let key = read(&paths.service_account_key);
    assert!(key.contains("PRIVATE KEY"));

    assert!(!pki::ensure_service_account_key(&paths.service_account_key).unwrap());
    assert_eq!(read(&paths.service_account_key), key);
}
