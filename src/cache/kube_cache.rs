// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reflector backed resource cache. Every relevant change enqueues a resync.

use super::{matches_ingress_class, split_name, ResourceCache};
use crate::config::DynamicConfig;
use crate::constants::{acme::TLS_CRT_KEY, acme::TLS_KEY_KEY, OPERATOR_NAME, RESYNC_KEY};
use crate::error::{ControllerError, Result};
use crate::queue::WorkQueue;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::ByteString;
use kube::{
    api::{ObjectMeta, Patch, PatchParams},
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

struct Writers {
    ingresses: Writer<Ingress>,
    secrets: Writer<Secret>,
    services: Writer<Service>,
}

pub struct KubeCache {
    client: Client,
    ingress_class: String,
    watch_without_class: bool,
    dynamic_config: Arc<DynamicConfig>,
    queue: WorkQueue<String>,
    ingresses: Store<Ingress>,
    secrets: Store<Secret>,
    services: Store<Service>,
    writers: Mutex<Option<Writers>>,
}

impl KubeCache {
    pub fn new(
        client: Client,
        ingress_class: &str,
        watch_without_class: bool,
        dynamic_config: Arc<DynamicConfig>,
        queue: WorkQueue<String>,
    ) -> Self {
        let (ingresses, ingress_writer) = reflector::store();
        let (secrets, secret_writer) = reflector::store();
        let (services, service_writer) = reflector::store();

        Self {
            client,
            ingress_class: ingress_class.to_string(),
            watch_without_class,
            dynamic_config,
            queue,
            ingresses,
            secrets,
            services,
            writers: Mutex::new(Some(Writers {
                ingresses: ingress_writer,
                secrets: secret_writer,
                services: service_writer,
            })),
        }
    }
}

/// Mirror `api` into `writer`, enqueueing a resync for every touched object accepted by `filter`
fn spawn_watch<K>(
    api: Api<K>,
    writer: Writer<K>,
    queue: WorkQueue<String>,
    stop: CancellationToken,
    filter: fn(&K) -> bool,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    tokio::spawn(async move {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .touched_objects();
        let mut stream = pin!(stream);

        info!("Starting {} watcher", kind);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(obj)) => {
                        if filter(&obj) {
                            debug!("{} {:?} changed", kind, obj.meta().name);
                            queue.add(RESYNC_KEY.to_string());
                        }
                    }
                    Some(Err(e)) => warn!("{} watch error: {}", kind, e),
                    None => break,
                },
            }
        }
        info!("{} watcher stopped", kind);
    })
}

fn any_object<K>(_: &K) -> bool {
    true
}

fn is_tls_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(TLS_SECRET_TYPE)
}

#[async_trait]
impl ResourceCache for KubeCache {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.ingresses
            .state()
            .into_iter()
            .filter(|i| self.is_valid_ingress(i))
            .collect()
    }

    fn is_valid_ingress(&self, ingress: &Ingress) -> bool {
        matches_ingress_class(ingress, &self.ingress_class, self.watch_without_class)
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    fn secret(&self, full_name: &str) -> Result<Arc<Secret>> {
        let (namespace, name) = split_name(full_name, "default");
        self.secrets
            .get(&ObjectRef::new(name).within(namespace))
            .ok_or_else(|| ControllerError::SecretNotFound(format!("{}/{}", namespace, name)))
    }

    fn tls_secret(&self, ingress_namespace: &str, secret_name: &str) -> Result<Arc<Secret>> {
        let (namespace, name) = split_name(secret_name, ingress_namespace);
        if namespace != ingress_namespace && !self.dynamic_config.static_cross_namespace_secrets {
            return Err(ControllerError::CrossNamespaceSecret(format!(
                "{}/{} referenced from namespace {}",
                namespace, name, ingress_namespace
            )));
        }
        self.secret(&format!("{}/{}", namespace, name))
    }

    #[instrument(skip(self, crt_pem, key_pem))]
    async fn store_certificate(&self, full_name: &str, crt_pem: &str, key_pem: &str) -> Result<()> {
        let (namespace, name) = split_name(full_name, "default");
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (TLS_CRT_KEY.to_string(), ByteString(crt_pem.as_bytes().to_vec())),
                (TLS_KEY_KEY.to_string(), ByteString(key_pem.as_bytes().to_vec())),
            ])),
            type_: Some(TLS_SECRET_TYPE.to_string()),
            ..Default::default()
        };

        let pp = PatchParams::apply(OPERATOR_NAME).force();
        secrets.patch(name, &pp, &Patch::Apply(&secret)).await?;

        info!("Stored certificate in secret {}/{}", namespace, name);
        Ok(())
    }

    fn run_async(&self, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(writers) = self
            .writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("Cache watchers already started");
            return Vec::new();
        };

        vec![
            spawn_watch(
                Api::<Ingress>::all(self.client.clone()),
                writers.ingresses,
                self.queue.clone(),
                stop.clone(),
                any_object,
            ),
            spawn_watch(
                Api::<Secret>::all(self.client.clone()),
                writers.secrets,
                self.queue.clone(),
                stop.clone(),
                is_tls_secret,
            ),
            spawn_watch(
                Api::<Service>::all(self.client.clone()),
                writers.services,
                self.queue.clone(),
                stop,
                any_object,
            ),
        ]
    }
}
