//! Certificate authority for every TLS identity inside the node
//!
//! A self-signed root is generated once, then one leaf per internal identity is
//! issued and signed by that root. Everything is persisted as PEM under
//! `<base>/pki/<identity>/`.
//!
//! # Reuse
//!
//! Issuance is skipped when both the certificate and the key file of an identity
//! already exist. Only existence is checked: an expired certificate, or one whose
//! SANs no longer match the host, is reused as is.
//!
//! # Failure
//!
//! [`issue_all`] stops at the first failing identity. Identities issued before the
//! failure stay on disk and are reused by the next run.

mod authority;
mod identity;

pub use authority::{issue, CertificateAuthority, IssueOutcome, IssuedCertificate};
pub use identity::{
    CertificateIdentity, ExtKeyUsage, IdentityPolicy, KeyUsage, PolicyContext,
    LEAF_VALIDITY_DAYS, ROOT_VALIDITY_DAYS,
};

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::config::Paths;
use crate::filesystem;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Root certificate or key missing when a leaf must be signed
    #[error("CA not initialized: {0}")]
    CaNotInitialized(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key could not be written
    #[error("failed to persist {0}")]
    Persist(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Signature does not verify against the expected issuer
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    Ok(cert)
}

/// Subject, validity and extension details of an issued certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// keyUsage bits present
    pub key_usages: BTreeSet<KeyUsage>,
    /// extendedKeyUsage purposes present
    pub extended_key_usages: BTreeSet<ExtKeyUsage>,
    /// Basic constraints mark this certificate as a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse_der(der)?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or("")
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut key_usages = BTreeSet::new();
        if let Ok(Some(ku)) = cert.key_usage() {
            let ku = ku.value;
            if ku.digital_signature() {
                key_usages.insert(KeyUsage::DigitalSignature);
            }
            if ku.key_encipherment() {
                key_usages.insert(KeyUsage::KeyEncipherment);
            }
            if ku.key_cert_sign() {
                key_usages.insert(KeyUsage::CertSign);
            }
            if ku.crl_sign() {
                key_usages.insert(KeyUsage::CrlSign);
            }
        }

        let mut extended_key_usages = BTreeSet::new();
        if let Ok(Some(eku)) = cert.extended_key_usage() {
            if eku.value.server_auth {
                extended_key_usages.insert(ExtKeyUsage::ServerAuth);
            }
            if eku.value.client_auth {
                extended_key_usages.insert(ExtKeyUsage::ClientAuth);
            }
        }

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organization,
            dns_names,
            ip_addresses,
            key_usages,
            extended_key_usages,
            is_ca,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|octets| IpAddr::V6(Ipv6Addr::from(octets))),
        _ => None,
    }
}

/// Verify that `cert_pem` carries a valid signature by the key of `issuer_pem`
pub fn verify_signed_by(cert_pem: &str, issuer_pem: &str) -> Result<()> {
    let cert_der = parse_pem(cert_pem)?;
    let issuer_der = parse_pem(issuer_pem)?;
    let cert = parse_der(&cert_der)?;
    let issuer = parse_der(&issuer_der)?;

    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| PkiError::VerificationFailed(format!("signature check failed: {}", e)))
}

/// Issue every identity in order: the root first, then each leaf
///
/// Stops at the first failure.
pub fn issue_all(paths: &Paths, ctx: &PolicyContext) -> Result<()> {
    info!(dir = %paths.pki_dir.display(), "Issuing certificates");

    for identity in CertificateIdentity::ALL {
        match issue(identity, paths, ctx)? {
            IssueOutcome::Reused => debug!(identity = %identity, "Reusing existing certificate"),
            IssueOutcome::Generated => info!(identity = %identity, "Generated certificate"),
        }
    }

    Ok(())
}

/// Generate the RSA key the API server signs service account tokens with
///
/// Returns whether a key was generated; an existing file is left untouched.
pub fn ensure_service_account_key(path: &Path) -> Result<bool> {
    if filesystem::file_exists(path) {
        debug!(path = %path.display(), "Service account key already present");
        return Ok(false);
    }

    let key = authority::generate_key()?;
    filesystem::write_file(path, key.serialize_pem().as_bytes(), filesystem::MODE_PRIVATE)
        .map_err(|e| PkiError::Persist(e.to_string()))?;

    info!(path = %path.display(), "Generated service account key");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn ctx() -> PolicyContext {
        PolicyContext {
            node_name: "edge-01".to_string(),
            local_ips: vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 7, 2)),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            ],
            kubernetes_service_ip: Ipv4Addr::new(10, 43, 0, 1),
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn now() -> i64 {
        ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    // ==========================================================================
    // Story Tests: Certificate Issuance on First Boot and Restart
    // ==========================================================================

    /// Story: a second boot reuses every certificate byte for byte
    ///
    /// Components keep trusting each other across restarts because nothing on
    /// disk changes once issued.
    #[test]
    fn story_restart_reuses_every_certificate() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());

        issue_all(&paths, &ctx()).unwrap();
        let first: Vec<(String, String)> = paths
            .all_certs()
            .iter()
            .map(|p| (read(&p.cert), read(&p.key)))
            .collect();

        issue_all(&paths, &ctx()).unwrap();
        let second: Vec<(String, String)> = paths
            .all_certs()
            .iter()
            .map(|p| (read(&p.cert), read(&p.key)))
            .collect();

        assert_eq!(first, second);
    }

    /// Story: every component trusts every other through the single root
    ///
    /// Leaves verify against the root, never against themselves.
    #[test]
    fn story_every_leaf_chains_to_the_root() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        issue_all(&paths, &ctx()).unwrap();

        let root = read(&paths.ca.cert);
        verify_signed_by(&root, &root).unwrap();

        for identity in CertificateIdentity::ALL.into_iter().filter(|i| !i.is_root()) {
            let leaf = read(&identity.paths(&paths).cert);
            verify_signed_by(&leaf, &root)
                .unwrap_or_else(|e| panic!("{identity} does not chain to root: {e}"));
            assert!(
                verify_signed_by(&leaf, &leaf).is_err(),
                "{identity} must not be self-signed"
            );
        }
    }

    /// Story: issued usages match what each consumer expects
    #[test]
    fn story_issued_usages_match_policy() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        issue_all(&paths, &ctx()).unwrap();

        for identity in CertificateIdentity::ALL {
            let policy = identity.policy(&ctx());
            let info = CertificateInfo::from_pem(&read(&identity.paths(&paths).cert)).unwrap();

            assert_eq!(info.key_usages, policy.key_usages, "{identity} key usage");
            assert_eq!(
                info.extended_key_usages, policy.extended_key_usages,
                "{identity} extended key usage"
            );
            assert_eq!(info.common_name, policy.common_name);
            assert_eq!(info.organization, policy.organization);
            assert_eq!(info.is_ca, identity.is_root());
        }
    }

    #[test]
    fn validity_follows_identity() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        issue_all(&paths, &ctx()).unwrap();

        let root = CertificateInfo::from_pem(&read(&paths.ca.cert)).unwrap();
        assert!((root.not_after - (now() + 3650 * 86400)).abs() < 120);

        let apiserver = CertificateInfo::from_pem(&read(&paths.apiserver.cert)).unwrap();
        assert!((apiserver.not_after - (now() + 365 * 86400)).abs() < 120);
        assert!(apiserver.not_before <= now());
        assert_eq!(apiserver.lifetime_secs(), 365 * 86400);
    }

    #[test]
    fn apiserver_certificate_carries_service_sans() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        issue_all(&paths, &ctx()).unwrap();

        let info = CertificateInfo::from_pem(&read(&paths.apiserver.cert)).unwrap();
        assert!(info.ip_addresses.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(info.ip_addresses.contains(&IpAddr::V4(Ipv4Addr::new(10, 43, 0, 1))));
        assert!(info.ip_addresses.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 7, 2))));
        assert!(info.dns_names.contains(&"kubernetes.default.svc".to_string()));
    }

    #[test]
    fn keys_are_private_and_certs_public() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        issue_all(&paths, &ctx()).unwrap();

        for cert in paths.all_certs() {
            let key_mode = fs::metadata(&cert.key).unwrap().permissions().mode() & 0o777;
            let cert_mode = fs::metadata(&cert.cert).unwrap().permissions().mode() & 0o777;
            assert_eq!(key_mode, 0o600, "{}", cert.key.display());
            assert_eq!(cert_mode, 0o644, "{}", cert.cert.display());
        }
    }

    #[test]
    fn leaf_without_root_fails() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        let err = issue(CertificateIdentity::Webhook, &paths, &ctx()).unwrap_err();
        assert!(matches!(err, PkiError::CaNotInitialized(_)));
        assert!(!paths.webhook.cert.exists());
    }

    #[test]
    fn service_account_key_is_generated_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pki/apiserver/service-account.key");

        assert!(ensure_service_account_key(&path).unwrap());
        let first = read(&path);
        assert!(first.contains("PRIVATE KEY"));
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);

        assert!(!ensure_service_account_key(&path).unwrap());
        assert_eq!(read(&path), first);
    }

    #[test]
    fn parse_pem_rejects_garbage() {
        assert!(matches!(parse_pem("not pem"), Err(PkiError::ParseError(_))));
    }
}
