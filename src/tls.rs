//! Certificate management: the gateway's own TLS identity.
//!
//! Provides:
//! - [`ensure_identity`]: load the listener certificate/key, generating a
//!   self-signed pair on first start
//! - [`build_server_config`]: a TLS 1.3 `rustls::ServerConfig` for the
//!   gateway port
//! - [`IdentityInfo`]: issuer / validity / fingerprint of a certificate
//!
//! The generated certificate carries a fixed issuer organisation
//! ([`DEFAULT_ORGANIZATION`] unless configured otherwise) so clients can tell
//! the gateway's certificate apart from any backend's own.
//!
//! # File format
//!
//! Certificate and key are stored in **PEM format**, both with mode `0600`.

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Issuer organisation stamped on generated certificates.
pub const DEFAULT_ORGANIZATION: &str = "lightgate autogenerated cert";

/// Default validity of a generated certificate.
pub const DEFAULT_VALIDITY_DAYS: u32 = 425;

// ─────────────────────────────────────────────────────────────────────────────
// Identity types
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating the listener identity.
#[derive(Debug, Clone)]
pub struct IdentityParams {
    /// Issuer / subject organisation.
    pub organization: String,
    /// DNS names in addition to `localhost`.
    pub extra_domains: Vec<String>,
    /// IP addresses in addition to the loopback addresses.
    pub extra_ips: Vec<IpAddr>,
    /// Validity period in days.
    pub validity_days: u32,
}

impl Default for IdentityParams {
    fn default() -> Self {
        Self {
            organization: DEFAULT_ORGANIZATION.to_string(),
            extra_domains: Vec::new(),
            extra_ips: Vec::new(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

/// Listener certificate and key in PEM format.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: ensure / generate
// ─────────────────────────────────────────────────────────────────────────────

/// Load the listener identity, generating it on first start.
///
/// If a certificate exists at `cert_path` it is loaded together with
/// `key_path` and returned unmodified. Otherwise a self-signed pair is
/// generated from `params` and written to both paths.
///
/// # Errors
///
/// * `Error::CertificateIo`: files cannot be read or written, or the key is
///   missing next to an existing certificate.
/// * `Error::CertificateGeneration`: key or certificate generation failed.
pub fn ensure_identity(
    cert_path: &Path,
    key_path: &Path,
    params: &IdentityParams,
) -> Result<TlsIdentity> {
    if cert_path.exists() {
        let identity = TlsIdentity {
            cert_pem: read_pem(cert_path)?,
            key_pem: read_pem(key_path)?,
        };
        debug!(cert = %cert_path.display(), "Loaded existing TLS identity");
        return Ok(identity);
    }

    regenerate_identity(cert_path, key_path, params)
}

/// Generate a fresh identity and overwrite both files.
///
/// # Errors
///
/// Same as [`ensure_identity`].
pub fn regenerate_identity(
    cert_path: &Path,
    key_path: &Path,
    params: &IdentityParams,
) -> Result<TlsIdentity> {
    let identity = generate_self_signed(params)?;
    write_private_file(cert_path, identity.cert_pem.as_bytes()).map_err(|e| {
        Error::CertificateIo(format!("Cannot write '{}': {e}", cert_path.display()))
    })?;
    write_private_file(key_path, identity.key_pem.as_bytes()).map_err(|e| {
        Error::CertificateIo(format!("Cannot write '{}': {e}", key_path.display()))
    })?;
    info!(
        cert = %cert_path.display(),
        organization = %params.organization,
        validity_days = params.validity_days,
        "Generated self-signed TLS identity"
    );
    Ok(identity)
}

/// Generate a self-signed certificate without touching the filesystem.
///
/// # Errors
///
/// Returns `Error::CertificateGeneration` if key generation or signing fails.
pub fn generate_self_signed(params: &IdentityParams) -> Result<TlsIdentity> {
    let key_pair = KeyPair::generate()
        .map_err(|e| Error::CertificateGeneration(format!("Failed to generate key: {e}")))?;

    let mut names = vec!["localhost".to_string()];
    names.extend(params.extra_domains.iter().cloned());
    names.extend(
        ["127.0.0.1", "::1"]
            .into_iter()
            .map(str::to_string)
            .chain(params.extra_ips.iter().map(ToString::to_string)),
    );

    let mut cert_params = CertificateParams::new(names)
        .map_err(|e| Error::CertificateGeneration(format!("Invalid subject names: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, params.organization.as_str());
    dn.push(DnType::CommonName, params.organization.as_str());
    cert_params.distinguished_name = dn;
    cert_params.not_before = days_from_now(0)?;
    cert_params.not_after = days_from_now(params.validity_days)?;

    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| Error::CertificateGeneration(format!("Self-signing failed: {e}")))?;

    Ok(TlsIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: rustls config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the gateway port's TLS server config.
///
/// TLS 1.3 only; ALPN offers HTTP/2 then HTTP/1.1 so native gRPC and
/// browser clients share the port. No client certificates are requested:
/// authentication happens per request in the admission layer.
///
/// # Errors
///
/// Returns `Error::Config` if the PEM data cannot be parsed or the
/// certificate and key do not match.
pub fn build_server_config(identity: &TlsIdentity) -> Result<ServerConfig> {
    let certs = load_certs(&identity.cert_pem)?;
    let key = load_private_key(&identity.key_pem)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(tls_cfg)
}

/// Parse all certificates from PEM text.
///
/// # Errors
///
/// Returns `Error::Config` if the PEM is invalid or holds no certificate.
pub fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config("No certificates found".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key from PEM text.
///
/// # Errors
///
/// Returns `Error::Config` if no supported key is present.
pub fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| Error::Config(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::Config("No private key found".to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate inspection
// ─────────────────────────────────────────────────────────────────────────────

/// Fields of interest from an X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Issuer organisation values, in order.
    pub issuer_organizations: Vec<String>,
    /// Expiry as a Unix timestamp.
    pub not_after: i64,
    /// SHA-256 fingerprint of the DER certificate (hex).
    pub fingerprint: String,
}

impl IdentityInfo {
    /// Inspect a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateIo` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::CertificateIo(format!("Failed to parse certificate: {e}")))?;

        let issuer_organizations = cert
            .issuer()
            .iter_organization()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_owned)
            .collect();

        Ok(Self {
            issuer_organizations,
            not_after: cert.validity().not_after.timestamp(),
            fingerprint: hex::encode(Sha256::digest(der)),
        })
    }

    /// Inspect the first certificate of an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM or the certificate cannot be parsed.
    pub fn from_identity(identity: &TlsIdentity) -> Result<Self> {
        let certs = load_certs(&identity.cert_pem)?;
        Self::from_der(certs[0].as_ref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::CertificateIo(format!("Cannot read '{}': {e}", path.display())))
}

/// Write `contents` to `path` readable by the owner only, creating parent
/// directories as needed.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

/// Midnight UTC `days` from today, in `rcgen`'s date representation.
fn days_from_now(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::CertificateGeneration(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::CertificateGeneration(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
