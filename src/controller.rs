// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Controller orchestrator: builds the components, runs their tasks and
//! handles every reconciliation taken from the work queue.

use crate::acme::{AcmeServer, AcmeTrigger, Signer, UnconfiguredAcmeClient, EXTERNAL_CALL};
use crate::cache::{KubeCache, ResourceCache};
use crate::config::Config;
use crate::constants::{acme::CHECK_JITTER_FACTOR, CONTROLLER_NAME, RESYNC_KEY};
use crate::converter::{parse_service_reference, Converter, ConverterOptions, IngressConverter};
use crate::error::Result;
use crate::leader::{
    dispatch_events, KubeLeaseStore, LeaderElectionConfig, LeaderElector, LeaderEvent,
    LeaderSubscriber, LeadershipHandle,
};
use crate::metrics::Metrics;
use crate::proxy::{self, HAProxyProcess, Instance, InstanceOptions};
use crate::queue::{FailureBackoffQueue, WorkQueue};
use crate::ssl::create_fake_certificate;
use crate::util::{jitter_until, until};
use async_trait::async_trait;
use kube::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FAKE_CERTIFICATE: &str = "default-fake-certificate";
const FAKE_CERTIFICATE_CN: &str = "Kubernetes Ingress Controller Fake Certificate";
const FAKE_CA: &str = "fake-ca";
const FAKE_CA_CN: &str = "Fake CA";

const PERIODIC_CHECK: &str = "periodic check";
const STARTED_LEADING: &str = "started leading";

/// Everything the controller runs, already built
pub struct ControllerParts {
    pub metrics: Metrics,
    pub queue: WorkQueue<String>,
    pub acme_queue: Option<FailureBackoffQueue<String>>,
    pub cache: Arc<dyn ResourceCache>,
    pub converter: Arc<dyn Converter>,
    pub instance: Arc<Instance>,
    pub signer: Option<Arc<Signer>>,
    pub elector: Option<(LeaderElector, mpsc::Receiver<LeaderEvent>)>,
    pub acme_server: Option<AcmeServer>,
    pub ingress_class: String,
    /// Zero disables idle sampling
    pub stats_period: Duration,
    pub acme_check_period: Duration,
    pub wait_before_shutdown: Duration,
}

pub struct Controller {
    metrics: Metrics,
    queue: WorkQueue<String>,
    acme_queue: Option<FailureBackoffQueue<String>>,
    cache: Arc<dyn ResourceCache>,
    converter: Arc<dyn Converter>,
    instance: Arc<Instance>,
    signer: Option<Arc<Signer>>,
    elector: Mutex<Option<(LeaderElector, mpsc::Receiver<LeaderEvent>)>>,
    acme_server: Mutex<Option<AcmeServer>>,
    ingress_class: String,
    stats_period: Duration,
    acme_check_period: Duration,
    wait_before_shutdown: Duration,
    leading: Mutex<Option<CancellationToken>>,
    update_count: AtomicU64,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Controller {
    /// Build every component from the operator configuration. Fails on an
    /// invalid flag, unusable templates or an unbindable acme socket, before
    /// anything is started.
    pub fn configure(config: &Config, client: Client) -> Result<Arc<Self>> {
        let reload_strategy = config.reload_strategy()?;
        info!("Using reload strategy {}", reload_strategy);
        let rate_limit = config.rate_limit_interval()?;
        if let Some(reference) = &config.default_backend_service {
            parse_service_reference(reference)?;
        }

        let metrics = Metrics::new(&config.buckets_response_time)?;
        let queue = WorkQueue::new(rate_limit);
        let acme_queue = config.acme_server.then(|| {
            FailureBackoffQueue::new(
                config.acme_fail_initial_duration,
                config.acme_fail_max_duration,
            )
        });

        let dynamic_config = Arc::new(config.dynamic_config());
        let cache: Arc<dyn ResourceCache> = Arc::new(KubeCache::new(
            client.clone(),
            &config.ingress_class,
            config.watch_ingress_without_class,
            dynamic_config,
            queue.clone(),
        ));

        let (elector, leadership, signer) = if config.acme_server {
            let election_id = config.election_id();
            info!("Leader election id {} as {}", election_id, config.pod_name);
            let store = Arc::new(KubeLeaseStore::new(
                client,
                &config.pod_namespace,
                &election_id,
            ));
            let (elector, events) =
                LeaderElector::new(store, LeaderElectionConfig::new(&config.pod_name));
            let leadership = elector.handle();
            let signer = Arc::new(Signer::new(
                Arc::new(UnconfiguredAcmeClient),
                cache.clone(),
                metrics.clone(),
            ));
            (Some((elector, events)), leadership, Some(signer))
        } else {
            (None, LeadershipHandle::fixed(false), None)
        };

        let fake_crt =
            create_fake_certificate(&config.ssl_dir, FAKE_CERTIFICATE, FAKE_CERTIFICATE_CN, false)?;
        let fake_ca = create_fake_certificate(&config.ssl_dir, FAKE_CA, FAKE_CA_CN, true)?;
        let converter = Arc::new(IngressConverter::new(
            cache.clone(),
            ConverterOptions {
                annotations_prefix: config.annotations_prefix.clone(),
                acme_track_tls_annotation: config.acme_track_tls_annotation,
                default_backend: config.default_backend_service.clone(),
                default_crt_secret: config.default_ssl_certificate.clone(),
                fake_crt,
                fake_ca,
                ssl_dir: config.ssl_dir.clone(),
            },
        ));

        let process = Arc::new(HAProxyProcess::new(
            &config.haproxy_binary,
            &config.admin_socket,
            config.master_socket.as_deref(),
            &proxy::pid_file(&config.haproxy_config_dir),
        ));
        let mut instance = Instance::new(
            InstanceOptions {
                templates_dir: config.templates_dir.clone(),
                config_dir: config.haproxy_config_dir.clone(),
                admin_socket: config.admin_socket.clone(),
                reload_strategy,
                max_old_config_files: config.max_old_config_files,
                validate_config: config.validate_config,
                acme_expiring: config.acme_expiring,
            },
            process,
            cache.clone(),
            metrics.clone(),
            acme_queue.clone(),
            leadership,
        );
        instance.parse_templates()?;

        let acme_server = if config.acme_server {
            Some(AcmeServer::bind(&config.acme_socket)?)
        } else {
            None
        };

        Ok(Self::from_parts(ControllerParts {
            metrics,
            queue,
            acme_queue,
            cache,
            converter,
            instance: Arc::new(instance),
            signer,
            elector,
            acme_server,
            ingress_class: config.ingress_class.clone(),
            stats_period: config.stats_collect_processing_period,
            acme_check_period: config.acme_check_period,
            wait_before_shutdown: Duration::from_secs(config.wait_before_shutdown),
        }))
    }

    pub fn from_parts(parts: ControllerParts) -> Arc<Self> {
        Arc::new(Self {
            metrics: parts.metrics,
            queue: parts.queue,
            acme_queue: parts.acme_queue,
            cache: parts.cache,
            converter: parts.converter,
            instance: parts.instance,
            signer: parts.signer,
            elector: Mutex::new(parts.elector),
            acme_server: Mutex::new(parts.acme_server),
            ingress_class: parts.ingress_class,
            stats_period: parts.stats_period,
            acme_check_period: parts.acme_check_period,
            wait_before_shutdown: parts.wait_before_shutdown,
            leading: Mutex::new(None),
            update_count: AtomicU64::new(0),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    pub fn default_ingress_class(&self) -> &str {
        &self.ingress_class
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Start every background task. Each of them ends once [`Controller::stop`] runs.
    pub fn start(self: &Arc<Self>) {
        info!("Starting {}", CONTROLLER_NAME);
        let mut tasks = self.cache.run_async(self.stop.clone());

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            let queue = this.queue.clone();
            queue
                .run(|item| {
                    let this = this.clone();
                    async move { this.sync_ingress(item).await }
                })
                .await;
        }));

        if let (Some(queue), Some(signer)) = (self.acme_queue.clone(), self.signer.clone()) {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .run(|item| {
                        let this = this.clone();
                        let signer = signer.clone();
                        async move { this.sign(&signer, item).await }
                    })
                    .await;
            }));
        }

        if !self.stats_period.is_zero() {
            let instance = self.instance.clone();
            tasks.push(tokio::spawn(until(
                self.stats_period,
                self.stop.clone(),
                move || {
                    let instance = instance.clone();
                    async move { instance.calc_idle_metric().await }
                },
            )));
        }

        if let Some((elector, events)) = lock(&self.elector).take() {
            tasks.push(tokio::spawn(elector.run(self.stop.clone())));
            let subscriber: Arc<dyn LeaderSubscriber> = self.clone();
            tasks.push(tokio::spawn(dispatch_events(events, subscriber)));
        }

        if let Some(server) = lock(&self.acme_server).take() {
            let trigger: Arc<dyn AcmeTrigger> = self.instance.clone();
            tasks.push(tokio::spawn(server.serve(trigger, self.stop.clone())));
        }

        if self.acme_queue.is_some() {
            let instance = self.instance.clone();
            tasks.push(tokio::spawn(jitter_until(
                self.acme_check_period,
                CHECK_JITTER_FACTOR,
                self.stop.clone(),
                move || {
                    let instance = instance.clone();
                    async move {
                        if let Err(e) = instance.acme_check(PERIODIC_CHECK).await {
                            error!("Periodic acme check failed: {}", e);
                        }
                    }
                },
            )));
        }

        self.queue.add(RESYNC_KEY.to_string());
        lock(&self.tasks).extend(tasks);
    }

    /// Stop accepting work, wait the configured grace period, then stop and
    /// join every task
    pub async fn stop(&self) {
        info!("Shutting down {}", CONTROLLER_NAME);
        self.queue.shut_down();
        if let Some(queue) = &self.acme_queue {
            queue.shut_down();
        }

        if !self.wait_before_shutdown.is_zero() {
            info!("Waiting {:?} before stopping", self.wait_before_shutdown);
            tokio::time::sleep(self.wait_before_shutdown).await;
        }
        self.stop.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Controller task failed: {}", e);
            }
        }
        info!("{} stopped", CONTROLLER_NAME);
    }

    /// Reconcile the proxy configuration with the cluster state. Invoked once
    /// per work queue item, never concurrently.
    pub async fn sync_ingress(&self, item: String) {
        if self.queue.shutting_down() {
            return;
        }
        let id = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.inc_reconciliation();
        info!("starting haproxy update id={} item={}", id, item);

        let mut timer = self.metrics.timer();
        let converted = {
            let mut config = self.instance.config();
            self.converter.sync(&mut timer, &mut config)
        };
        match converted {
            Ok(()) => self.instance.update(&mut timer).await,
            Err(e) => error!(
                "Failed to convert cluster resources, keeping the current configuration id={}: {}",
                id, e
            ),
        }

        info!("finish haproxy update id={}: {}", id, timer.as_string("total"));
    }

    fn leading_token(&self) -> Option<CancellationToken> {
        lock(&self.leading)
            .as_ref()
            .filter(|token| !token.is_cancelled())
            .cloned()
    }

    /// Handle one signing item, only while leading
    async fn sign(&self, signer: &Signer, item: String) -> Result<()> {
        let Some(leading) = self.leading_token() else {
            debug!("Not leading, skipping signing of {}", item);
            return Ok(());
        };
        signer.notify(&item, &leading).await
    }

    /// Certificate check requested from outside the controller
    pub async fn acme_check(&self) -> Result<usize> {
        self.instance.acme_check(EXTERNAL_CALL).await
    }
}

#[async_trait]
impl LeaderSubscriber for Controller {
    async fn on_started_leading(&self, leading: CancellationToken) {
        *lock(&self.leading) = Some(leading);
        if let Err(e) = self.instance.acme_check(STARTED_LEADING).await {
            error!("Acme check after becoming leader failed: {}", e);
        }
    }

    fn on_stopped_leading(&self) {
        if let Some(token) = lock(&self.leading).take() {
            token.cancel();
        }
        if let Some(queue) = &self.acme_queue {
            queue.clear();
        }
        info!("Stopped leading, pending certificate signing dropped");
    }

    fn on_new_leader(&self, identity: &str) {
        info!("New leader elected: {}", identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReloadStrategy;
    use crate::error::ControllerError;
    use crate::test_utils::{FakeAcmeClient, FakeCache, FakeConverter, FakeProcess, MockService};
    use clap::Parser;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        controller: Arc<Controller>,
        converter: Arc<FakeConverter>,
        acme_client: Arc<FakeAcmeClient>,
        acme_queue: FailureBackoffQueue<String>,
        _dir: tempfile::TempDir,
    }

    fn fixture(rate_limit: Duration, leader: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("haproxy.tmpl"),
            "global\n{{ global }}\n{{ frontends }}\n{{ backends }}\n",
        )
        .unwrap();

        let metrics = Metrics::new(&[0.1, 1.0]).unwrap();
        let cache = Arc::new(FakeCache::default());
        let converter = Arc::new(FakeConverter::default());
        let acme_client = Arc::new(FakeAcmeClient::default());
        let acme_queue = FailureBackoffQueue::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut instance = Instance::new(
            InstanceOptions {
                templates_dir: dir.path().to_path_buf(),
                config_dir: dir.path().join("config"),
                admin_socket: dir.path().join("admin.sock"),
                reload_strategy: ReloadStrategy::ReuseSocket,
                max_old_config_files: 0,
                validate_config: false,
                acme_expiring: Duration::from_secs(30 * 24 * 3600),
            },
            Arc::new(FakeProcess::default()),
            cache.clone(),
            metrics.clone(),
            Some(acme_queue.clone()),
            LeadershipHandle::fixed(leader),
        );
        instance.parse_templates().unwrap();
        let signer = Arc::new(Signer::new(acme_client.clone(), cache.clone(), metrics.clone()));

        let controller = Controller::from_parts(ControllerParts {
            metrics,
            queue: WorkQueue::new(rate_limit),
            acme_queue: Some(acme_queue.clone()),
            cache,
            converter: converter.clone(),
            instance: Arc::new(instance),
            signer: Some(signer),
            elector: None,
            acme_server: None,
            ingress_class: "haproxy".to_string(),
            stats_period: Duration::ZERO,
            acme_check_period: Duration::from_secs(24 * 3600),
            wait_before_shutdown: Duration::ZERO,
        });

        Fixture {
            controller,
            converter,
            acme_client,
            acme_queue,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_update_counter_increments_per_reconciliation() {
        let f = fixture(Duration::ZERO, false);

        for _ in 0..3 {
            f.controller.sync_ingress(RESYNC_KEY.to_string()).await;
        }

        assert_eq!(f.controller.update_count(), 3);
        assert_eq!(f.controller.metrics().reconciliations(), 3);
        assert_eq!(f.converter.calls(), 3);
    }

    #[tokio::test]
    async fn test_handler_returns_while_shutting_down() {
        let f = fixture(Duration::ZERO, false);
        f.controller.queue.shut_down();

        f.controller.sync_ingress(RESYNC_KEY.to_string()).await;

        assert_eq!(f.controller.update_count(), 0);
        assert_eq!(f.converter.calls(), 0);
    }

    #[tokio::test]
    async fn test_converter_failure_keeps_configuration() {
        let f = fixture(Duration::ZERO, false);
        f.controller.sync_ingress(RESYNC_KEY.to_string()).await;
        let applied = f.controller.instance.applied().unwrap();

        f.converter.set_failing(true);
        f.controller.sync_ingress(RESYNC_KEY.to_string()).await;

        assert_eq!(f.controller.update_count(), 2);
        assert_eq!(f.controller.instance.applied().unwrap().config, applied.config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_enqueues_coalesce() {
        let f = fixture(Duration::from_secs(2), false);

        f.controller.start();
        for _ in 0..3 {
            f.controller.queue.add(RESYNC_KEY.to_string());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(f.controller.update_count(), 1);
        assert_eq!(f.converter.calls(), 1);

        f.controller.stop().await;
        assert!(lock(&f.controller.tasks).is_empty());
    }

    #[tokio::test]
    async fn test_stopped_leading_clears_pending_signing() {
        let f = fixture(Duration::ZERO, true);
        *lock(&f.controller.leading) = Some(CancellationToken::new());
        f.acme_queue.add("default/a,a.example.com".to_string());
        f.acme_queue.add("default/b,b.example.com".to_string());
        assert_eq!(f.acme_queue.len(), 2);

        f.controller.on_stopped_leading();

        assert_eq!(f.acme_queue.len(), 0);
        assert!(f.controller.leading_token().is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let runner = {
            let queue = f.acme_queue.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .run(|_| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), ControllerError>(())
                        }
                    })
                    .await
            })
        };
        f.acme_queue.shut_down();
        runner.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_started_leading_runs_acme_check() {
        let f = fixture(Duration::ZERO, true);
        f.controller
            .instance
            .config()
            .acme
            .insert("default/tls".to_string(), BTreeSet::from(["a.example.com".to_string()]));

        f.controller.on_started_leading(CancellationToken::new()).await;

        assert!(f.controller.leading_token().is_some());
        assert_eq!(f.acme_queue.len(), 1);
        assert_eq!(f.controller.metrics().acme_signs(true), 0);
    }

    #[tokio::test]
    async fn test_signing_skipped_without_leadership() {
        let f = fixture(Duration::ZERO, true);
        let signer = f.controller.signer.clone().unwrap();

        f.controller
            .sign(&signer, "default/tls,a.example.com".to_string())
            .await
            .unwrap();
        assert_eq!(f.acme_client.calls(), 0);

        *lock(&f.controller.leading) = Some(CancellationToken::new());
        f.controller
            .sign(&signer, "default/tls,a.example.com".to_string())
            .await
            .unwrap();
        assert_eq!(f.acme_client.calls(), 1);
    }

    #[tokio::test]
    async fn test_info() {
        let f = fixture(Duration::ZERO, false);
        assert_eq!(f.controller.name(), "HAProxy Ingress Controller");
        assert_eq!(f.controller.default_ingress_class(), "haproxy");
    }

    #[tokio::test]
    async fn test_configure_rejects_unsupported_reload_strategy() {
        let config = Config::try_parse_from(["haproxy-ingress", "--reload-strategy", "graceful"])
            .unwrap();
        let client = MockService::new().into_client();

        let err = Controller::configure(&config, client).err().unwrap();

        assert!(matches!(err, ControllerError::UnsupportedReloadStrategy(s) if s == "graceful"));
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_default_backend() {
        let dir = tempfile::tempdir().unwrap();
        let ssl = dir.path().join("ssl");
        let config = Config::try_parse_from([
            "haproxy-ingress",
            "--default-backend-service",
            "default-http",
            "--ssl-dir",
            ssl.to_str().unwrap(),
        ])
        .unwrap();
        let client = MockService::new().into_client();

        let err = Controller::configure(&config, client).err().unwrap();

        assert!(matches!(err, ControllerError::ConversionError(_)));
        assert!(!ssl.exists());
    }

    #[tokio::test]
    async fn test_configure_rejects_out_of_range_rate_limit() {
        let config =
            Config::try_parse_from(["haproxy-ingress", "--rate-limit-update", "1e-30"]).unwrap();
        let client = MockService::new().into_client();

        let err = Controller::configure(&config, client).err().unwrap();

        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_configure_fails_on_missing_templates() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let ssl = dir.path().join("ssl");
        let config = Config::try_parse_from([
            "haproxy-ingress",
            "--reload-strategy",
            "multibinder",
            "--templates-dir",
            templates.to_str().unwrap(),
            "--ssl-dir",
            ssl.to_str().unwrap(),
        ])
        .unwrap();
        let client = MockService::new().into_client();

        let err = Controller::configure(&config, client).err().unwrap();

        assert!(matches!(err, ControllerError::TemplateError(_)));
        assert!(ssl.join("default-fake-certificate.pem").exists());
    }
}
