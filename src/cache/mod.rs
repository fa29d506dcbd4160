// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster resource cache consumed by the converter and the certificate workflow.

pub mod kube_cache;

pub use kube_cache::KubeCache;

use crate::constants::annotations;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ResourceCache: Send + Sync {
    /// Ingress resources handled by this controller
    fn ingresses(&self) -> Vec<Arc<Ingress>>;

    fn is_valid_ingress(&self, ingress: &Ingress) -> bool;

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;

    /// Secret by its `namespace/name`
    fn secret(&self, full_name: &str) -> Result<Arc<Secret>>;

    /// TLS secret referenced by an ingress. `secret_name` is either a plain
    /// name in the ingress namespace or a `namespace/name` reference
    fn tls_secret(&self, ingress_namespace: &str, secret_name: &str) -> Result<Arc<Secret>>;

    /// Store a signed certificate and its key in the `namespace/name` secret
    async fn store_certificate(&self, full_name: &str, crt_pem: &str, key_pem: &str) -> Result<()>;

    /// Start the watchers feeding the cache, they stop when `stop` is cancelled
    fn run_async(&self, stop: CancellationToken) -> Vec<JoinHandle<()>>;
}

/// Split a `namespace/name` reference, defaulting to `default_namespace`
pub fn split_name<'a>(full_name: &'a str, default_namespace: &'a str) -> (&'a str, &'a str) {
    match full_name.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, full_name),
    }
}

/// Whether an ingress belongs to `ingress_class`
pub fn matches_ingress_class(
    ingress: &Ingress,
    ingress_class: &str,
    accept_without_class: bool,
) -> bool {
    let annotation = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::INGRESS_CLASS));
    let class_name = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_ref());

    match (annotation, class_name) {
        (Some(class), _) => class == ingress_class,
        (None, Some(class)) => class == ingress_class,
        (None, None) => accept_without_class,
    }
}
