//! Certificate authority
//!
//! Issues and validates device X.509 certificates under a single
//! self-signed root. One PEM pair per device under `ca_dir`, plus a JSON
//! revocation file. A revoked certificate never validates again, even if
//! the device is later re-onboarded with a fresh certificate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    SanType, PKCS_ECDSA_P256_SHA256,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{AttestationReason, CoreError, CoreResult};

const ROOT_CERT_FILE: &str = "root_cert.pem";
const ROOT_KEY_FILE: &str = "root_key.pem";
const REVOCATION_FILE: &str = "revoked.json";
const ROOT_COMMON_NAME: &str = "trustplane-root-ca";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const DEVICE_VALIDITY_DAYS: i64 = 365;

/// Result of validating a certificate against the root and revocation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(AttestationReason),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevocationEntry {
    device_id: String,
    revoked_at: DateTime<Utc>,
    reason: String,
}

/// The framework's single certificate authority.
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    root: Certificate,
    root_cert_pem: String,
    /// Revoked certificate fingerprints (SHA-256 over DER).
    revoked: StdMutex<HashMap<String, RevocationEntry>>,
}

fn ca_err(context: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::storage(format!("{}: {}", context, err))
}

impl CertificateAuthority {
    /// Load the root pair from `ca_dir`, or create a fresh self-signed
    /// root when none exists yet.
    pub fn init_or_load_root(ca_dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(ca_dir)
            .map_err(|e| ca_err("create ca_dir", e))?;

        let cert_path = ca_dir.join(ROOT_CERT_FILE);
        let key_path = ca_dir.join(ROOT_KEY_FILE);

        let (root, root_cert_pem) = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|e| ca_err("read root cert", e))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|e| ca_err("read root key", e))?;
            let key_pair =
                KeyPair::from_pem(&key_pem).map_err(|e| ca_err("parse root key", e))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
                .map_err(|e| ca_err("parse root cert", e))?;
            let root =
                Certificate::from_params(params).map_err(|e| ca_err("load root", e))?;
            info!("[CA] Loaded root certificate from {}", cert_path.display());
            (root, cert_pem)
        } else {
            let mut params = CertificateParams::new(vec![]);
            params.alg = &PKCS_ECDSA_P256_SHA256;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, ROOT_COMMON_NAME);
            dn.push(DnType::OrganizationName, "trustplane");
            params.distinguished_name = dn;
            params.not_before = time::OffsetDateTime::now_utc();
            params.not_after =
                time::OffsetDateTime::now_utc() + time::Duration::days(ROOT_VALIDITY_DAYS);

            let root =
                Certificate::from_params(params).map_err(|e| ca_err("generate root", e))?;
            let cert_pem = root
                .serialize_pem()
                .map_err(|e| ca_err("serialize root cert", e))?;
            let key_pem = root.serialize_private_key_pem();

            std::fs::write(&cert_path, &cert_pem)
                .map_err(|e| ca_err("write root cert", e))?;
            std::fs::write(&key_path, key_pem).map_err(|e| ca_err("write root key", e))?;
            info!("[CA] Generated new root certificate at {}", cert_path.display());
            (root, cert_pem)
        };

        let revoked = load_revocations(&ca_dir.join(REVOCATION_FILE))?;

        Ok(Self {
            ca_dir: ca_dir.to_path_buf(),
            root,
            root_cert_pem,
            revoked: StdMutex::new(revoked),
        })
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// Issue a device certificate signed by the root. Returns the PEM
    /// paths; any previous certificate file for the device is replaced.
    pub fn issue(&self, device_id: &str, mac: &str) -> CoreResult<(PathBuf, PathBuf)> {
        let mut params = CertificateParams::new(vec![]);
        params.alg = &PKCS_ECDSA_P256_SHA256;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, device_id);
        // The bound physical identity rides in the OU field.
        dn.push(DnType::OrganizationalUnitName, mac);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(format!("{}.device.local", device_id))];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(DEVICE_VALIDITY_DAYS);

        let cert =
            Certificate::from_params(params).map_err(|e| ca_err("generate device cert", e))?;
        let cert_pem = cert
            .serialize_pem_with_signer(&self.root)
            .map_err(|e| ca_err("sign device cert", e))?;
        let key_pem = cert.serialize_private_key_pem();

        let cert_path = self.ca_dir.join(format!("{}.pem", device_id));
        let key_path = self.ca_dir.join(format!("{}.key.pem", device_id));
        std::fs::write(&cert_path, &cert_pem).map_err(|e| ca_err("write device cert", e))?;
        std::fs::write(&key_path, key_pem).map_err(|e| ca_err("write device key", e))?;

        info!("[CA] Issued certificate for {} ({})", device_id, mac);
        Ok((cert_path, key_path))
    }

    /// Validate a device certificate: revocation, root signature,
    /// validity window, and subject binding, in that order.
    pub fn validate(&self, device_id: &str, cert_pem: &str) -> CoreResult<ValidationOutcome> {
        let der = pem_to_der(cert_pem)?;

        let fingerprint = fingerprint_der(&der);
        {
            let revoked = self.revoked.lock().expect("revocation set poisoned");
            if revoked.contains_key(&fingerprint) {
                return Ok(ValidationOutcome::Invalid(AttestationReason::Revoked));
            }
        }

        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| ca_err("parse device cert", format!("{:?}", e)))?;

        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        if issuer_cn != Some(ROOT_COMMON_NAME) {
            return Ok(ValidationOutcome::Invalid(AttestationReason::UnknownIssuer));
        }

        let root_der = pem_to_der(&self.root_cert_pem)?;
        let (_, root_cert) = X509Certificate::from_der(&root_der)
            .map_err(|e| ca_err("parse root cert", format!("{:?}", e)))?;
        if cert
            .verify_signature(Some(root_cert.public_key()))
            .is_err()
        {
            return Ok(ValidationOutcome::Invalid(AttestationReason::UnknownIssuer));
        }

        if !cert.validity().is_valid() {
            return Ok(ValidationOutcome::Invalid(AttestationReason::ExpiredCert));
        }

        let subject_cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        if subject_cn != Some(device_id) {
            return Ok(ValidationOutcome::Invalid(
                AttestationReason::SubjectMismatch,
            ));
        }

        Ok(ValidationOutcome::Valid)
    }

    /// Validate the certificate stored for a device on disk.
    pub fn validate_device_file(&self, device_id: &str) -> CoreResult<ValidationOutcome> {
        let cert_path = self.ca_dir.join(format!("{}.pem", device_id));
        let cert_pem = match std::fs::read_to_string(&cert_path) {
            Ok(pem) => pem,
            Err(_) => {
                warn!("[CA] No certificate on disk for {}", device_id);
                return Ok(ValidationOutcome::Invalid(AttestationReason::UnknownIssuer));
            }
        };
        self.validate(device_id, &cert_pem)
    }

    /// Revoke the device's current certificate. Idempotent.
    pub fn revoke(&self, device_id: &str, reason: &str) -> CoreResult<()> {
        let cert_path = self.ca_dir.join(format!("{}.pem", device_id));
        let cert_pem = std::fs::read_to_string(&cert_path)
            .map_err(|_| CoreError::not_found("certificate", device_id))?;
        let der = pem_to_der(&cert_pem)?;
        let fingerprint = fingerprint_der(&der);

        {
            let mut revoked = self.revoked.lock().expect("revocation set poisoned");
            revoked.insert(
                fingerprint,
                RevocationEntry {
                    device_id: device_id.to_string(),
                    revoked_at: Utc::now(),
                    reason: reason.to_string(),
                },
            );
            persist_revocations(&self.ca_dir.join(REVOCATION_FILE), &revoked)?;
        }

        info!("[CA] Revoked certificate for {}: {}", device_id, reason);
        Ok(())
    }
}

fn pem_to_der(pem: &str) -> CoreResult<Vec<u8>> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| ca_err("decode PEM", format!("{:?}", e)))?;
    Ok(parsed.contents)
}

fn fingerprint_der(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

fn load_revocations(path: &Path) -> CoreResult<HashMap<String, RevocationEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ca_err("read revocation file", e))?;
    serde_json::from_str(&raw).map_err(|e| ca_err("parse revocation file", e))
}

fn persist_revocations(
    path: &Path,
    revoked: &HashMap<String, RevocationEntry>,
) -> CoreResult<()> {
    let raw = serde_json::to_string_pretty(revoked)
        .map_err(|e| ca_err("serialize revocation file", e))?;
    std::fs::write(path, raw).map_err(|e| ca_err("write revocation file", e))?;
    Ok(())
}
