// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Proxy configuration model and the planning of updates against the live proxy.

use crate::constants::proxy::SLOTS_INCREMENT;
use std::collections::{BTreeMap, BTreeSet};
use crate::ssl::CrtFile;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backend {
    /// `<namespace>_<service>_<port>`
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

impl Backend {
    pub fn new(namespace: &str, service: &str, port: &str) -> Self {
        Self {
            name: format!("{}_{}_{}", namespace, service, port),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPath {
    pub path: String,
    pub backend: String,
}

/// PEM file referenced by the configuration. The content hash makes a
/// rewritten file at the same path a configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemFile {
    pub path: PathBuf,
    pub sha1_hash: String,
}

impl PemFile {
    pub fn new(path: impl Into<PathBuf>, sha1_hash: &str) -> Self {
        Self {
            path: path.into(),
            sha1_hash: sha1_hash.to_string(),
        }
    }
}

impl From<&CrtFile> for PemFile {
    fn from(crt: &CrtFile) -> Self {
        Self::new(crt.filename.clone(), &crt.sha1_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Host {
    pub hostname: String,
    pub paths: Vec<HostPath>,
    /// Certificate served for this host, the default certificate when `None`
    pub crt_file: Option<PemFile>,
    /// CA used to verify client certificates
    pub ca_file: Option<PemFile>,
}

impl Host {
    /// Add a path, keeping paths ordered from the most to the least specific
    pub fn add_path(&mut self, path: &str, backend: &str) {
        if self.paths.iter().any(|p| p.path == path) {
            return;
        }
        self.paths.push(HostPath {
            path: path.to_string(),
            backend: backend.to_string(),
        });
        self.paths
            .sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));
    }
}

/// Desired proxy state, rebuilt by the converter on every reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyConfig {
    pub hosts: BTreeMap<String, Host>,
    pub backends: BTreeMap<String, Backend>,
    pub default_backend: Option<String>,
    pub default_crt: Option<PemFile>,
    /// TLS secrets signed by ACME (`namespace/name`) and the domains they must cover
    pub acme: BTreeMap<String, BTreeSet<String>>,
}

impl ProxyConfig {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn acquire_host(&mut self, hostname: &str) -> &mut Host {
        self.hosts
            .entry(hostname.to_string())
            .or_insert_with(|| Host {
                hostname: hostname.to_string(),
                ..Default::default()
            })
    }

    pub fn acquire_backend(&mut self, namespace: &str, service: &str, port: &str) -> &mut Backend {
        let backend = Backend::new(namespace, service, port);
        self.backends
            .entry(backend.name.clone())
            .or_insert(backend)
    }

    /// Whether both configurations only differ in backend endpoints
    fn same_structure(&self, other: &ProxyConfig) -> bool {
        self.hosts == other.hosts
            && self.default_backend == other.default_backend
            && self.default_crt == other.default_crt
            && self.backends.keys().eq(other.backends.keys())
    }
}

/// Configuration currently running in the proxy
#[derive(Debug, Clone)]
pub struct AppliedState {
    pub config: ProxyConfig,
    /// Server slots allocated per backend
    pub slots: BTreeMap<String, usize>,
}

impl AppliedState {
    pub fn new(config: ProxyConfig, previous: Option<&AppliedState>) -> Self {
        let slots = plan_slots(&config, previous.map(|p| &p.slots));
        Self { config, slots }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePlan {
    Unchanged,
    /// Endpoint changes that fit the allocated slots, applied over the admin socket
    Dynamic(Vec<String>),
    Reload(String),
}

/// Number of slots needed for `endpoints`, rounded up to a whole block
pub fn slots_for(endpoints: usize) -> usize {
    endpoints.div_ceil(SLOTS_INCREMENT).max(1) * SLOTS_INCREMENT
}

/// Slots per backend, never shrinking the slots of a backend that is still configured
pub fn plan_slots(
    config: &ProxyConfig,
    previous: Option<&BTreeMap<String, usize>>,
) -> BTreeMap<String, usize> {
    config
        .backends
        .values()
        .map(|backend| {
            let needed = slots_for(backend.endpoints.len());
            let kept = previous
                .and_then(|p| p.get(&backend.name))
                .copied()
                .unwrap_or(0);
            (backend.name.clone(), needed.max(kept))
        })
        .collect()
}

pub fn server_name(slot: usize) -> String {
    format!("srv{:03}", slot + 1)
}

/// Compare the desired configuration against what is running
pub fn plan_update(applied: Option<&AppliedState>, desired: &ProxyConfig) -> UpdatePlan {
    let Some(applied) = applied else {
        return UpdatePlan::Reload("initial configuration".to_string());
    };
    if !applied.config.same_structure(desired) {
        return UpdatePlan::Reload("frontend or backend list changed".to_string());
    }

    let mut commands = Vec::new();
    for (name, backend) in &desired.backends {
        let Some(current) = applied.config.backends.get(name) else {
            continue;
        };
        if current.endpoints == backend.endpoints {
            continue;
        }
        let slots = applied.slots.get(name).copied().unwrap_or(0);
        if backend.endpoints.len() > slots {
            return UpdatePlan::Reload(format!("backend {} needs more server slots", name));
        }
        for slot in 0..slots {
            let server = format!("{}/{}", name, server_name(slot));
            match backend.endpoints.get(slot) {
                Some(ep) => {
                    commands.push(format!("set server {} addr {} port {}", server, ep.ip, ep.port));
                    commands.push(format!("set server {} weight {}", server, ep.weight));
                    commands.push(format!("set server {} state ready", server));
                }
                None if slot < current.endpoints.len() => {
                    commands.push(format!("set server {} state maint", server));
                }
                None => {}
            }
        }
    }

    if commands.is_empty() {
        UpdatePlan::Unchanged
    } else {
        UpdatePlan::Dynamic(commands)
    }
}
