// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Certificate files generated at startup and certificate inspection helpers.

use crate::error::{ControllerError, Result};
use chrono::{DateTime, Utc};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use x509_parser::extensions::GeneralName;

/// A TLS artifact written to disk and referenced by the proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtFile {
    pub filename: PathBuf,
    /// Hex encoded sha1 of the file content
    pub sha1_hash: String,
    pub common_name: String,
    pub not_after: DateTime<Utc>,
}

/// What the controller needs to know about a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: String,
    pub dns_names: BTreeSet<String>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Whether every domain in `domains` is covered by this certificate
    pub fn covers<'a>(&self, domains: impl IntoIterator<Item = &'a String>) -> bool {
        domains
            .into_iter()
            .all(|d| self.dns_names.contains(d) || self.common_name == *d)
    }
}

/// Parse the first certificate of a PEM bundle
pub fn parse_certificate(pem_data: &[u8]) -> Result<CertificateInfo> {
    let pem = pem::parse(pem_data)
        .map_err(|e| ControllerError::CertificateError(format!("Failed to parse PEM: {}", e)))?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ControllerError::CertificateError(format!("Invalid X509 certificate: {}", e))
    })?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut dns_names = BTreeSet::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.insert(dns.to_string());
            }
        }
    }

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
        ControllerError::CertificateError(format!("Invalid expiration timestamp: {}", timestamp))
    })?;

    Ok(CertificateInfo {
        common_name,
        dns_names,
        not_after,
    })
}

/// Generate a self signed certificate and its key, written as a single PEM file
/// to `<dir>/<name>.pem`
pub fn create_fake_certificate(
    dir: &Path,
    name: &str,
    common_name: &str,
    is_ca: bool,
) -> Result<CrtFile> {
    let key_pair = KeyPair::generate().map_err(cert_error)?;
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(cert_error)?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    distinguished_name.push(DnType::OrganizationName, "Acme Co");
    params.distinguished_name = distinguished_name;
    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }

    let cert = params.self_signed(&key_pair).map_err(cert_error)?;
    let cert_pem = cert.pem();
    let content = if is_ca {
        cert_pem.clone()
    } else {
        format!("{}{}", cert_pem, key_pair.serialize_pem())
    };

    write_crt_file(dir, name, content.as_bytes())
}

/// Write PEM content to `<dir>/<name>.pem` and describe the result
pub fn write_crt_file(dir: &Path, name: &str, content: &[u8]) -> Result<CrtFile> {
    let info = parse_certificate(content)?;
    fs::create_dir_all(dir)?;
    let filename = dir.join(format!("{}.pem", name));
    fs::write(&filename, content)?;

    info!("Created certificate file {}", filename.display());

    Ok(CrtFile {
        filename,
        sha1_hash: sha1_hex(content),
        common_name: info.common_name,
        not_after: info.not_after,
    })
}

pub fn sha1_hex(content: &[u8]) -> String {
    hex::encode(Sha1::digest(content))
}

fn cert_error(e: rcgen::Error) -> ControllerError {
    ControllerError::CertificateError(format!("Failed to generate certificate: {}", e))
}

#[cfg(test)]
pub(crate) fn self_signed_pem(domains: &[&str], days: i64) -> String {
    use chrono::Datelike;
    use rcgen::date_time_ymd;

    let key_pair = KeyPair::generate().unwrap();
    let names: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, domains[0]);
    params.distinguished_name = distinguished_name;
    let expires = Utc::now() + chrono::Duration::days(days);
    params.not_before = date_time_ymd(2020, 1, 1);
    params.not_after = date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);
    params.self_signed(&key_pair).unwrap().pem()
}
