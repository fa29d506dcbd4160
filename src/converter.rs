// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Builds the proxy configuration model from the cached cluster resources.

use crate::cache::{split_name, ResourceCache};
use crate::constants::acme::{TLS_CRT_KEY, TLS_KEY_KEY};
use crate::constants::annotations;
use crate::error::{ControllerError, Result};
use crate::metrics::Timer;
use crate::proxy::model::{Endpoint, PemFile, ProxyConfig};
use crate::ssl::{sha1_hex, write_crt_file, CrtFile};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend, ServiceBackendPort};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host name used for rules without a host
pub const DEFAULT_HOST: &str = "*";

const CA_KEY: &str = "ca.crt";
const AUTH_TLS_SECRET: &str = "auth-tls-secret";

pub trait Converter: Send + Sync {
    /// Rebuild `config` from the current cluster state
    fn sync(&self, timer: &mut Timer, config: &mut ProxyConfig) -> Result<()>;
}

pub struct ConverterOptions {
    pub annotations_prefix: String,
    pub acme_track_tls_annotation: bool,
    /// `namespace/service:port`
    pub default_backend: Option<String>,
    /// `namespace/secret`
    pub default_crt_secret: Option<String>,
    pub fake_crt: CrtFile,
    pub fake_ca: CrtFile,
    pub ssl_dir: PathBuf,
}

pub struct IngressConverter {
    cache: Arc<dyn ResourceCache>,
    options: ConverterOptions,
}

impl IngressConverter {
    pub fn new(cache: Arc<dyn ResourceCache>, options: ConverterOptions) -> Self {
        Self { cache, options }
    }

    fn annotation<'a>(&self, ingress: &'a Ingress, name: &str) -> Option<&'a String> {
        let key = format!("{}/{}", self.options.annotations_prefix, name);
        ingress.metadata.annotations.as_ref()?.get(&key)
    }

    fn acme_enabled(&self, ingress: &Ingress) -> bool {
        if self
            .annotation(ingress, annotations::CERT_SIGNER)
            .is_some_and(|v| v == annotations::CERT_SIGNER_ACME)
        {
            return true;
        }
        self.options.acme_track_tls_annotation
            && ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(annotations::TLS_ACME))
                .is_some_and(|v| v == "true")
    }

    /// Write `content` to the ssl directory unless it is already there
    fn pem_file(&self, name: &str, content: &[u8]) -> Result<PemFile> {
        let path = self.options.ssl_dir.join(format!("{}.pem", name));
        if fs::read(&path).is_ok_and(|existing| existing == content) {
            return Ok(PemFile::new(path, &sha1_hex(content)));
        }
        let crt = write_crt_file(&self.options.ssl_dir, name, content)?;
        Ok(PemFile::from(&crt))
    }

    fn crt_file(&self, secret: &Secret, file_name: &str) -> Result<PemFile> {
        let data = secret.data.as_ref();
        let crt = data.and_then(|d| d.get(TLS_CRT_KEY));
        let key = data.and_then(|d| d.get(TLS_KEY_KEY));
        let (Some(crt), Some(key)) = (crt, key) else {
            return Err(ControllerError::CertificateError(format!(
                "{} and {} required",
                TLS_CRT_KEY, TLS_KEY_KEY
            )));
        };
        let mut content = crt.0.clone();
        if !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend_from_slice(&key.0);
        self.pem_file(file_name, &content)
    }

    fn default_crt(&self) -> PemFile {
        let Some(secret_name) = &self.options.default_crt_secret else {
            return PemFile::from(&self.options.fake_crt);
        };
        let (namespace, name) = split_name(secret_name, "default");
        let crt = self
            .cache
            .secret(secret_name)
            .and_then(|secret| self.crt_file(&secret, &format!("{}_{}", namespace, name)));
        match crt {
            Ok(path) => path,
            Err(e) => {
                warn!("Using fake default certificate, {} is invalid: {}", secret_name, e);
                PemFile::from(&self.options.fake_crt)
            }
        }
    }

    fn tls_crt(&self, namespace: &str, secret_name: &str) -> Option<PemFile> {
        let (secret_ns, name) = split_name(secret_name, namespace);
        let crt = self
            .cache
            .tls_secret(namespace, secret_name)
            .and_then(|secret| self.crt_file(&secret, &format!("{}_{}", secret_ns, name)));
        match crt {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Using default certificate, TLS secret {}/{}: {}", secret_ns, name, e);
                None
            }
        }
    }

    /// CA used to verify client certificates. An unusable secret falls back to
    /// the fake CA, so no client certificate is accepted.
    fn ca_file(&self, namespace: &str, secret_name: &str) -> PemFile {
        let (secret_ns, name) = split_name(secret_name, namespace);
        let ca = self
            .cache
            .tls_secret(namespace, secret_name)
            .and_then(|secret| {
                secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(CA_KEY))
                    .map(|ca| ca.0.clone())
                    .ok_or_else(|| {
                        ControllerError::CertificateError(format!("{} missing", CA_KEY))
                    })
            })
            .and_then(|ca| self.pem_file(&format!("ca_{}_{}", secret_ns, name), &ca));
        match ca {
            Ok(path) => path,
            Err(e) => {
                warn!("Using fake CA, client CA secret {}/{}: {}", secret_ns, name, e);
                PemFile::from(&self.options.fake_ca)
            }
        }
    }

    /// Add the backend for a service port, returning its name
    fn acquire_backend(
        &self,
        config: &mut ProxyConfig,
        namespace: &str,
        service: &IngressServiceBackend,
    ) -> String {
        let port = service.port.as_ref();
        let port_label = port
            .and_then(|p| p.number.map(|n| n.to_string()).or_else(|| p.name.clone()))
            .unwrap_or_default();

        let exists = config
            .backends
            .contains_key(&format!("{}_{}_{}", namespace, service.name, port_label));
        let backend = config.acquire_backend(namespace, &service.name, &port_label);
        if exists {
            return backend.name.clone();
        }

        let Some(svc) = self.cache.service(namespace, &service.name) else {
            warn!("Service {}/{} not found", namespace, service.name);
            return backend.name.clone();
        };
        let spec = svc.spec.as_ref();
        let cluster_ip = spec
            .and_then(|s| s.cluster_ip.as_deref())
            .filter(|ip| !ip.is_empty() && *ip != "None");
        let service_port = spec
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| {
                ports.iter().find(|p| match port {
                    Some(bp) if bp.number.is_some() => bp.number == Some(p.port),
                    Some(bp) => bp.name.is_some() && bp.name == p.name,
                    None => true,
                })
            });

        match (cluster_ip, service_port) {
            (Some(ip), Some(sp)) => backend.endpoints.push(Endpoint {
                ip: ip.to_string(),
                port: sp.port as u16,
                weight: 1,
            }),
            _ => warn!(
                "Service {}/{} has no usable address for port {}",
                namespace, service.name, port_label
            ),
        }
        backend.name.clone()
    }

    fn add_default_backend(&self, config: &mut ProxyConfig, reference: &str) -> Result<String> {
        let (namespace, service) = parse_service_reference(reference)?;
        Ok(self.acquire_backend(config, namespace, &service))
    }

    fn sync_ingress(&self, config: &mut ProxyConfig, ingress: &Ingress) {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        let Some(spec) = &ingress.spec else {
            return;
        };
        debug!("Parsing ingress {}/{}", namespace, name);

        if config.default_backend.is_none() {
            if let Some(service) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
                config.default_backend = Some(self.acquire_backend(config, namespace, service));
            }
        }

        let mut tls_hosts: BTreeMap<&str, &str> = BTreeMap::new();
        for tls in spec.tls.iter().flatten() {
            let Some(secret) = tls.secret_name.as_deref() else {
                continue;
            };
            for host in tls.hosts.iter().flatten() {
                tls_hosts.insert(host.as_str(), secret);
            }
        }
        let acme = self.acme_enabled(ingress);
        let ca = self
            .annotation(ingress, AUTH_TLS_SECRET)
            .map(|secret| self.ca_file(namespace, secret));

        for rule in spec.rules.iter().flatten() {
            let hostname = rule.host.as_deref().unwrap_or(DEFAULT_HOST);
            let Some(http) = &rule.http else {
                continue;
            };

            let mut paths = Vec::new();
            for path in &http.paths {
                let Some(service) = &path.backend.service else {
                    continue;
                };
                let backend = self.acquire_backend(config, namespace, service);
                paths.push((path.path.clone().unwrap_or_else(|| "/".to_string()), backend));
            }

            let secret = tls_hosts.get(hostname).copied();
            let crt_file = secret.and_then(|s| self.tls_crt(namespace, s));
            let host = config.acquire_host(hostname);
            for (path, backend) in &paths {
                host.add_path(path, backend);
            }
            if crt_file.is_some() {
                host.crt_file = crt_file;
            }
            if ca.is_some() {
                host.ca_file = ca.clone();
            }

            if let (true, Some(secret)) = (acme, secret) {
                let (secret_ns, secret_name) = split_name(secret, namespace);
                config
                    .acme
                    .entry(format!("{}/{}", secret_ns, secret_name))
                    .or_default()
                    .insert(hostname.to_string());
            }
        }
    }
}

/// Parse a `namespace/service:port` reference. The port is either a number
/// or a port name.
pub fn parse_service_reference(reference: &str) -> Result<(&str, IngressServiceBackend)> {
    let invalid = || {
        ControllerError::ConversionError(format!(
            "Invalid default backend '{}', expected namespace/service:port",
            reference
        ))
    };
    let (full_name, port) = reference.rsplit_once(':').ok_or_else(invalid)?;
    let (namespace, name) = full_name.split_once('/').ok_or_else(invalid)?;
    if namespace.is_empty() || name.is_empty() || port.is_empty() {
        return Err(invalid());
    }
    let port = match port.parse::<i32>() {
        Ok(number) => ServiceBackendPort {
            number: Some(number),
            name: None,
        },
        Err(_) => ServiceBackendPort {
            number: None,
            name: Some(port.to_string()),
        },
    };
    Ok((
        namespace,
        IngressServiceBackend {
            name: name.to_string(),
            port: Some(port),
        },
    ))
}

impl Converter for IngressConverter {
    /// On failure `config` is left untouched
    fn sync(&self, timer: &mut Timer, config: &mut ProxyConfig) -> Result<()> {
        let mut next = ProxyConfig::default();
        if let Some(reference) = &self.options.default_backend {
            next.default_backend = Some(self.add_default_backend(&mut next, reference)?);
        }
        next.default_crt = Some(self.default_crt());

        let mut ingresses = self.cache.ingresses();
        ingresses.sort_by(|a, b| {
            let key_a = (&a.metadata.namespace, &a.metadata.name);
            key_a.cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        for ingress in &ingresses {
            self.sync_ingress(&mut next, ingress);
        }

        *config = next;
        timer.tick("parse_ingress");
        Ok(())
    }
}
