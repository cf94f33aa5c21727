//! Local certificate authority for the development TLS setup
//!
//! Generates a self-signed CA plus a wildcard server certificate covering the
//! base domain, and persists both under the certificate directory. Idempotent
//! across restarts: the CA pair is created once and reused for server-cert
//! rotations, and externally-managed server certificates (e.g. from mkcert)
//! are adopted as-is.

use anyhow::{bail, Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// CA certificate lifetime
const CA_VALIDITY_DAYS: i64 = 10 * 365;
/// Server certificate lifetime
const SERVER_VALIDITY_DAYS: i64 = 365;

/// Result of [`CertAuthority::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Certificates were generated (or regenerated) by the local CA
    Generated,
    /// Pre-existing server cert/key were adopted untouched
    Adopted,
}

/// Paths of every file the authority manages.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    /// CA certificate in raw DER, for OS trust stores
    pub ca_crt: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

/// Generates and persists the development CA and server certificate.
pub struct CertAuthority {
    certs_dir: PathBuf,
    base_domain: String,
}

impl CertAuthority {
    pub fn new(certs_dir: impl Into<PathBuf>, base_domain: impl Into<String>) -> Self {
        Self {
            certs_dir: certs_dir.into(),
            base_domain: base_domain.into(),
        }
    }

    pub fn paths(&self) -> CertPaths {
        CertPaths {
            ca_cert: self.certs_dir.join("ca.pem"),
            ca_key: self.certs_dir.join("ca-key.pem"),
            ca_crt: self.certs_dir.join("ca.crt"),
            server_cert: self.certs_dir.join("cert.pem"),
            server_key: self.certs_dir.join("key.pem"),
        }
    }

    /// Make sure a usable server cert/key pair exists on disk.
    ///
    /// If both server files already exist they are adopted as-is and the CA
    /// is never touched. A half-present pair (server or CA) is a fatal
    /// misconfiguration rather than something to silently overwrite.
    pub fn ensure(&self) -> Result<EnsureOutcome> {
        let paths = self.paths();

        let cert_exists = paths.server_cert.exists();
        let key_exists = paths.server_key.exists();

        if cert_exists && key_exists {
            debug!(dir = %self.certs_dir.display(), "adopting existing server certificate");
            return Ok(EnsureOutcome::Adopted);
        }
        if cert_exists != key_exists {
            bail!(
                "incomplete server certificate setup: only one of cert.pem/key.pem exists in {}",
                self.certs_dir.display()
            );
        }

        fs::create_dir_all(&self.certs_dir).with_context(|| {
            format!(
                "failed to create certificate directory {}",
                self.certs_dir.display()
            )
        })?;

        let issuer = self.load_or_generate_ca(&paths)?;
        self.issue_server_cert(&issuer, &paths)?;

        info!(
            dir = %self.certs_dir.display(),
            domain = %self.base_domain,
            "server certificate issued"
        );
        Ok(EnsureOutcome::Generated)
    }

    /// Warn if an adopted server certificate does not cover the base domain.
    ///
    /// Mismatches are tolerated so externally-managed certificates keep
    /// working, but the operator should know routing hostnames may fail TLS
    /// verification.
    pub fn warn_on_domain_mismatch(&self) {
        let paths = self.paths();
        let wildcard = format!("*.{}", self.base_domain);

        let covered = match server_cert_dns_names(&paths.server_cert) {
            Ok(names) => {
                names.contains(&wildcard) || names.contains(&self.base_domain.to_string())
            }
            Err(e) => {
                warn!(
                    path = %paths.server_cert.display(),
                    error = %e,
                    "could not inspect adopted server certificate"
                );
                return;
            }
        };

        if !covered {
            warn!(
                path = %paths.server_cert.display(),
                expected = %wildcard,
                "adopted server certificate does not cover the base domain"
            );
        }
    }

    fn load_or_generate_ca(&self, paths: &CertPaths) -> Result<Issuer<'static, KeyPair>> {
        let ca_cert_exists = paths.ca_cert.exists();
        let ca_key_exists = paths.ca_key.exists();

        if ca_cert_exists != ca_key_exists {
            bail!(
                "incomplete CA setup: only one of ca.pem/ca-key.pem exists in {}",
                self.certs_dir.display()
            );
        }

        if ca_cert_exists && ca_key_exists {
            debug!(path = %paths.ca_cert.display(), "reusing existing CA");
            let key_pem = fs::read_to_string(&paths.ca_key)
                .with_context(|| format!("failed to read {}", paths.ca_key.display()))?;
            let key = KeyPair::from_pem(&key_pem)
                .with_context(|| format!("failed to parse {}", paths.ca_key.display()))?;
            let cert_der = read_pem_certificate(&paths.ca_cert)?;
            return Issuer::from_ca_cert_der(&cert_der, key)
                .with_context(|| format!("failed to parse {}", paths.ca_cert.display()));
        }

        info!(dir = %self.certs_dir.display(), "generating new CA");

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .context("failed to generate CA key")?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "roji Dev CA");
        dn.push(DnType::CommonName, "roji CA");
        params.distinguished_name = dn;

        let cert = params.self_signed(&key).context("failed to self-sign CA")?;

        write_atomic(&paths.ca_cert, cert.pem().as_bytes(), 0o644)?;
        write_atomic(&paths.ca_key, key.serialize_pem().as_bytes(), 0o600)?;
        write_atomic(&paths.ca_crt, cert.der(), 0o644)?;

        Ok(Issuer::new(params, key))
    }

    fn issue_server_cert(&self, issuer: &Issuer<'static, KeyPair>, paths: &CertPaths) -> Result<()> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .context("failed to generate server key")?;

        let mut params = CertificateParams::new(self.server_dns_names())
            .context("failed to build server certificate parameters")?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + Duration::days(SERVER_VALIDITY_DAYS);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "roji");
        dn.push(DnType::CommonName, format!("*.{}", self.base_domain));
        params.distinguished_name = dn;

        let cert = params
            .signed_by(&key, issuer)
            .context("failed to sign server certificate")?;

        write_atomic(&paths.server_cert, cert.pem().as_bytes(), 0o644)?;
        write_atomic(&paths.server_key, key.serialize_pem().as_bytes(), 0o600)?;

        Ok(())
    }

    /// Subject Alternative Names for the server certificate.
    ///
    /// `*.<base>` covers the generated hostnames, `*.*.<base>` the
    /// service-in-project form (unless the base already is `localhost`,
    /// where single-label wildcards suffice).
    fn server_dns_names(&self) -> Vec<String> {
        let mut names = vec![
            format!("*.{}", self.base_domain),
            self.base_domain.clone(),
            "localhost".to_string(),
        ];
        if self.base_domain != "localhost" {
            names.push(format!("*.*.{}", self.base_domain));
        }
        names.dedup();
        names
    }
}

/// 128-bit random certificate serial.
fn random_serial() -> SerialNumber {
    SerialNumber::from(rand::random::<[u8; 16]>().to_vec())
}

/// Read the first certificate from a PEM file.
fn read_pem_certificate(path: &Path) -> Result<CertificateDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut certs = rustls_pemfile::certs(&mut reader);
    match certs.next() {
        Some(Ok(cert)) => Ok(cert),
        Some(Err(e)) => Err(e).with_context(|| format!("failed to parse {}", path.display())),
        None => bail!("no certificate found in {}", path.display()),
    }
}

/// DNS SANs of the server certificate on disk.
fn server_cert_dns_names(path: &Path) -> Result<Vec<String>> {
    let data = fs::read(path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|e| anyhow::anyhow!("invalid PEM: {e}"))?;
    let cert = pem.parse_x509().context("invalid certificate")?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    Ok(names)
}

/// Write a file so it is either fully present or absent, never truncated.
///
/// Writes into a sibling temp file and renames over the target. `mode` is
/// applied on Unix (0600 for private keys).
fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options
            .open(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}
