//! PEM loading and certificate generation.
//!
//! Provides:
//! - [`load_certs`] / [`load_private_key`] / [`load_crls`] - PEM file loading
//! - [`CertGenerator`] - `rcgen`-backed generation for the `flowgate tls` commands
//!   and for test fixtures
//!
//! # File format
//!
//! All certificate, key and CRL files are expected in **PEM format**.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    date_time_ymd,
};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    parse_certs(&pem_data).map_err(|e| Error::Config(format!("{e} in '{path}'")))
}

/// Parse all certificates from PEM bytes.
///
/// # Errors
///
/// Returns an error if the data holds no valid certificate block.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config("No certificates found".to_string()));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    parse_private_key(&pem_data).map_err(|e| Error::Config(format!("{e} in '{path}'")))
}

/// Parse the first private key from PEM bytes.
///
/// # Errors
///
/// Returns an error if no supported key block is present.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Config(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::Config("No private key found".to_string()))
}

/// Load CRL entries from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a CRL block is malformed.
pub fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::crls(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse CRL from '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the root CA.
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for generating a leaf certificate (server or client).
#[derive(Debug, Default)]
pub struct LeafCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Organization (optional).
    pub organization: Option<&'a str>,
    /// Organizational Unit (optional).
    pub ou: Option<&'a str>,
    /// Subject Alternative Names. Entries that parse as IP addresses become
    /// IP SANs, everything else a DNS SAN.
    pub sans: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a leaf certificate signed by `ca_cert_pem` / `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cert/key cannot be parsed, a SAN is
    /// invalid, or signing fails.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = CertificateParams::new(params.sans.clone())
            .map_err(|e| Error::Config(format!("Invalid SAN in {:?}: {e}", params.sans)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        if let Some(org) = params.organization {
            dn.push(DnType::OrganizationName, org);
        }
        if let Some(ou) = params.ou {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        leaf_params.distinguished_name = dn;
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.not_after = validity_to_date(params.validity_days)?;

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Config(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Write a [`GeneratedCert`] to disk as `<stem>.crt` and `<stem>.key`
    /// under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

/// Date `days` from today, in the form `rcgen` expects.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    let future = time::OffsetDateTime::now_utc()
        .checked_add(time::Duration::days(i64::from(days)))
        .ok_or_else(|| Error::Config(format!("Validity of {days} days is out of range")))?;
    Ok(date_time_ymd(future.year(), future.month() as u8, future.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
