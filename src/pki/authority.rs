//! Key generation, signing and persistence of one identity

use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};

use super::identity::{CertificateIdentity, ExtKeyUsage, IdentityPolicy, KeyUsage, PolicyContext};
use super::{PkiError, Result};
use crate::config::{CertPaths, Paths};
use crate::filesystem;

/// Compute certificate validity period from now
fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(days);
    (now, not_after)
}

/// Generate a 2048-bit RSA key pair
pub(super) fn generate_key() -> Result<KeyPair> {
    KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_2048)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e)))
}

/// Random positive 128-bit serial number
fn random_serial() -> SerialNumber {
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes)
}

fn build_params(policy: &IdentityPolicy) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(policy.common_name.clone()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(policy.organization.clone()),
    );
    params.distinguished_name = dn;

    params.is_ca = if policy.is_ca {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    params.key_usages = policy
        .key_usages
        .iter()
        .map(|usage| match usage {
            KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
            KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
            KeyUsage::CertSign => KeyUsagePurpose::KeyCertSign,
            KeyUsage::CrlSign => KeyUsagePurpose::CrlSign,
        })
        .collect();
    params.extended_key_usages = policy
        .extended_key_usages
        .iter()
        .map(|usage| match usage {
            ExtKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            ExtKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        })
        .collect();

    let (not_before, not_after) = compute_validity(policy.validity_days);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());

    let mut sans = Vec::with_capacity(policy.dns_names.len() + policy.ip_addresses.len());
    for name in &policy.dns_names {
        let dns = Ia5String::try_from(name.clone()).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })?;
        sans.push(SanType::DnsName(dns));
    }
    sans.extend(policy.ip_addresses.iter().copied().map(SanType::IpAddress));
    params.subject_alt_names = sans;

    Ok(params)
}

/// PEM-encoded certificate and private key of one identity
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM private key (PKCS#8)
    pub key_pem: String,
}

impl IssuedCertificate {
    /// Write the pair to disk: the certificate world-readable, the key owner-only
    pub fn persist(&self, paths: &CertPaths) -> Result<()> {
        filesystem::write_file(&paths.cert, self.cert_pem.as_bytes(), filesystem::MODE_PUBLIC)
            .map_err(|e| PkiError::Persist(e.to_string()))?;
        filesystem::write_file(&paths.key, self.key_pem.as_bytes(), filesystem::MODE_PRIVATE)
            .map_err(|e| PkiError::Persist(e.to_string()))?;
        Ok(())
    }
}

/// Root certificate and key used to sign leaves
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed root from `policy`
    pub fn generate(policy: &IdentityPolicy) -> Result<Self> {
        let params = build_params(policy)?;
        let key_pair = generate_key()?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_cert_pem: cert.pem(),
            ca_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load the root from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = super::parse_pem(cert_pem)?;

        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pem: key_pem.to_string(),
        })
    }

    /// Load the root from its files on disk
    pub fn load(paths: &CertPaths) -> Result<Self> {
        for path in [&paths.cert, &paths.key] {
            if !filesystem::file_exists(path) {
                return Err(PkiError::CaNotInitialized(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }
        let cert_pem = std::fs::read_to_string(&paths.cert)?;
        let key_pem = std::fs::read_to_string(&paths.key)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Root certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The root as an issued pair, for persisting
    pub fn to_issued(&self) -> IssuedCertificate {
        IssuedCertificate {
            cert_pem: self.ca_cert_pem.clone(),
            key_pem: self.ca_key_pem.clone(),
        }
    }

    /// Issue a leaf for `policy` with a fresh key, signed by this root
    pub fn sign(&self, policy: &IdentityPolicy) -> Result<IssuedCertificate> {
        let mut params = build_params(policy)?;
        params.use_authority_key_identifier_extension = true;

        let leaf_key = generate_key()?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                policy.common_name, e
            ))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

/// Whether [`issue`] wrote new files or kept existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// Certificate and key were already on disk
    Reused,
    /// A new pair was generated and written
    Generated,
}

/// Issue one identity unless its certificate and key already exist
///
/// Leaves are signed by the root loaded from disk, so the root must be issued first.
pub fn issue(
    identity: CertificateIdentity,
    paths: &Paths,
    ctx: &PolicyContext,
) -> Result<IssueOutcome> {
    let target = identity.paths(paths);
    if filesystem::file_exists(&target.cert) && filesystem::file_exists(&target.key) {
        return Ok(IssueOutcome::Reused);
    }

    let policy = identity.policy(ctx);
    let issued = if identity.is_root() {
        CertificateAuthority::generate(&policy)?.to_issued()
    } else {
        CertificateAuthority::load(&paths.ca)?.sign(&policy)?
    };
    issued.persist(target)?;

    Ok(IssueOutcome::Generated)
}
