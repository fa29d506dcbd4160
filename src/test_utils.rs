// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a mock Kubernetes API and in-memory fakes of the
//! controller collaborators.

use crate::acme::{AcmeClient, SignedCertificate};
use crate::cache::{matches_ingress_class, split_name, ResourceCache};
use crate::config::ReloadStrategy;
use crate::constants::acme::TLS_CRT_KEY;
use crate::converter::Converter;
use crate::error::{ControllerError, Result};
use crate::leader::{LeaseRecord, LeaseStore};
use crate::metrics::Timer;
use crate::proxy::model::PemFile;
use crate::proxy::{ProxyConfig, ProxyProcess};
use async_trait::async_trait;
use http::{Request, Response};
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::client::Body;
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::Service as TowerService;

type ResponseFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Response<Body>, tower::BoxError>> + Send>>;

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            (status, body.to_string()),
        );
        self
    }

    /// Add a response for GET requests matching the exact path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    /// Add a response for PUT requests matching the exact path
    pub fn on_put(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PUT", path, status, body)
    }

    /// Add a response for PATCH requests matching the exact path
    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "default")
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        self.responses
            .lock()
            .unwrap()
            .get(&(method.to_string(), path.to_string()))
            .cloned()
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl TowerService<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = ResponseFuture;

    fn poll_ready(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let (status, body) = self
            .find_response(&method, &path)
            .unwrap_or_else(|| (404, not_found_json("path", &path)));

        Box::pin(async move {
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

/// A coordination.k8s.io/v1 Lease held by `holder`, renewed just now
pub fn lease_json(name: &str, holder: &str, resource_version: &str) -> String {
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
    serde_json::json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": {
            "name": name,
            "namespace": "ingress",
            "resourceVersion": resource_version
        },
        "spec": {
            "holderIdentity": holder,
            "leaseDurationSeconds": 15,
            "acquireTime": now,
            "renewTime": now,
            "leaseTransitions": 3
        }
    })
    .to_string()
}

/// Ingress routing `/` of `host` to `service:port`
pub fn make_ingress(name: &str, namespace: &str, host: &str, service: &str, port: i32) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn make_service(name: &str, namespace: &str, cluster_ip: &str, port: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ports: Some(vec![ServicePort {
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// TLS secret holding `crt_pem`
pub fn tls_secret(crt_pem: &str) -> Secret {
    Secret {
        data: Some(BTreeMap::from([(
            TLS_CRT_KEY.to_string(),
            ByteString(crt_pem.as_bytes().to_vec()),
        )])),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

/// Lease store kept in memory, with compare-and-swap on the resource version
#[derive(Default)]
pub struct MemoryLeaseStore {
    record: Mutex<Option<LeaseRecord>>,
    version: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn with_record(record: LeaseRecord) -> Self {
        let store = Self::default();
        *store.record.lock().unwrap() = Some(record);
        store
    }

    pub fn holder(&self) -> Option<String> {
        self.record
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.holder_identity.clone())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControllerError::LeaseError("store unavailable".to_string()));
        }
        Ok(())
    }

    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 100).to_string())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.record.lock().unwrap().clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        self.check_available()?;
        let mut current = self.record.lock().unwrap();
        if current.is_some() {
            return Err(ControllerError::LeaseError("lease already exists".to_string()));
        }
        *current = Some(LeaseRecord {
            resource_version: self.next_version(),
            ..record.clone()
        });
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        self.check_available()?;
        let mut current = self.record.lock().unwrap();
        let current_version = current.as_ref().and_then(|r| r.resource_version.clone());
        if current.is_none() || current_version != record.resource_version {
            return Err(ControllerError::LeaseError("conflict".to_string()));
        }
        *current = Some(LeaseRecord {
            resource_version: self.next_version(),
            ..record.clone()
        });
        Ok(())
    }
}

/// Proxy process recording the commands it receives
#[derive(Default)]
pub struct FakeProcess {
    commands: Mutex<Vec<String>>,
    command_response: Mutex<String>,
    checks: AtomicUsize,
    reloads: AtomicUsize,
    fail_reload: AtomicBool,
}

impl FakeProcess {
    /// Response returned for every admin socket command
    pub fn set_command_response(&self, response: &str) {
        *self.command_response.lock().unwrap() = response.to_string();
    }

    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    /// Commands sent to the admin socket, `show info` excluded
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Successful reloads
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyProcess for FakeProcess {
    async fn command(&self, cmd: &str) -> Result<String> {
        if cmd != "show info" {
            self.commands.lock().unwrap().push(cmd.to_string());
        }
        Ok(self.command_response.lock().unwrap().clone())
    }

    async fn check_config(&self, _path: &Path) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self, _strategy: ReloadStrategy, path: &Path) -> Result<()> {
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(ControllerError::ProxyCommandError(format!(
                "reload of {} failed",
                path.display()
            )));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resource cache backed by maps, accepts ingresses of class "haproxy" and
/// ingresses without a class
#[derive(Default)]
pub struct FakeCache {
    ingresses: Mutex<Vec<Arc<Ingress>>>,
    services: Mutex<HashMap<(String, String), Arc<Service>>>,
    secrets: Mutex<HashMap<String, Arc<Secret>>>,
    stored: Mutex<Vec<(String, String, String)>>,
}

impl FakeCache {
    pub fn add_ingress(&self, ingress: Ingress) {
        self.ingresses.lock().unwrap().push(Arc::new(ingress));
    }

    pub fn add_service(&self, service: Service) {
        let key = (
            service.metadata.namespace.clone().unwrap_or_default(),
            service.metadata.name.clone().unwrap_or_default(),
        );
        self.services.lock().unwrap().insert(key, Arc::new(service));
    }

    pub fn add_secret(&self, full_name: &str, secret: Secret) {
        self.secrets
            .lock()
            .unwrap()
            .insert(full_name.to_string(), Arc::new(secret));
    }

    /// Certificates stored so far: secret, certificate, key
    pub fn stored(&self) -> Vec<(String, String, String)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceCache for FakeCache {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.ingresses
            .lock()
            .unwrap()
            .iter()
            .filter(|i| self.is_valid_ingress(i))
            .cloned()
            .collect()
    }

    fn is_valid_ingress(&self, ingress: &Ingress) -> bool {
        matches_ingress_class(ingress, "haproxy", true)
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn secret(&self, full_name: &str) -> Result<Arc<Secret>> {
        self.secrets
            .lock()
            .unwrap()
            .get(full_name)
            .cloned()
            .ok_or_else(|| ControllerError::SecretNotFound(full_name.to_string()))
    }

    fn tls_secret(&self, ingress_namespace: &str, secret_name: &str) -> Result<Arc<Secret>> {
        let (namespace, name) = split_name(secret_name, ingress_namespace);
        self.secret(&format!("{}/{}", namespace, name))
    }

    async fn store_certificate(&self, full_name: &str, crt_pem: &str, key_pem: &str) -> Result<()> {
        self.stored.lock().unwrap().push((
            full_name.to_string(),
            crt_pem.to_string(),
            key_pem.to_string(),
        ));
        Ok(())
    }

    fn run_async(&self, _stop: CancellationToken) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Converter adding one host per call, optionally failing
#[derive(Default)]
pub struct FakeConverter {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeConverter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Converter for FakeConverter {
    fn sync(&self, timer: &mut Timer, config: &mut ProxyConfig) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControllerError::ConversionError("broken ingress".to_string()));
        }
        config.clear();
        config
            .acquire_host("app.example.com")
            .add_path("/", "default_app_8080");
        config.acquire_backend("default", "app", "8080");
        config.default_crt = Some(PemFile::new("/ssl/fake.pem", "0a1b"));
        timer.tick("parse_ingress");
        Ok(())
    }
}

/// ACME client returning a fixed certificate
#[derive(Default)]
pub struct FakeAcmeClient {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeAcmeClient {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AcmeClient for FakeAcmeClient {
    async fn sign(&self, domains: &[String]) -> Result<SignedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControllerError::SignerError(format!(
                "order for {} rejected",
                domains.join(",")
            )));
        }
        Ok(SignedCertificate {
            crt_pem: format!("crt for {}", domains.join(",")),
            key_pem: "key".to_string(),
        })
    }
}
