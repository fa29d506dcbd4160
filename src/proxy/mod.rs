// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Proxy instance manager: owns the configuration model and applies it to the
//! running proxy.

pub mod files;
pub mod model;
pub mod process;
pub mod templates;

pub use model::{AppliedState, ProxyConfig, UpdatePlan};
pub use process::{HAProxyProcess, ProxyProcess};

use crate::acme::AcmeTrigger;
use crate::cache::ResourceCache;
use crate::config::ReloadStrategy;
use crate::constants::acme::TLS_CRT_KEY;
use crate::error::{ControllerError, Result};
use crate::leader::LeadershipHandle;
use crate::metrics::{Metrics, Timer};
use crate::queue::FailureBackoffQueue;
use crate::ssl::parse_certificate;
use async_trait::async_trait;
use chrono::Utc;
use files::ConfigFiles;
use model::plan_update;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use templates::{render_crt_list, RenderContext, Template};
use tracing::{debug, error, info, warn};

const CRT_LIST_FILE: &str = "crt-list.txt";

#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub templates_dir: PathBuf,
    pub config_dir: PathBuf,
    pub admin_socket: PathBuf,
    pub reload_strategy: ReloadStrategy,
    /// Non positive keeps a single configuration file
    pub max_old_config_files: i32,
    /// Check the configuration after dynamic updates as well
    pub validate_config: bool,
    /// Certificates expiring within this duration are signed again
    pub acme_expiring: Duration,
}

pub struct Instance {
    options: InstanceOptions,
    template: Option<Template>,
    config: Mutex<ProxyConfig>,
    applied: Mutex<Option<AppliedState>>,
    files: Mutex<ConfigFiles>,
    process: Arc<dyn ProxyProcess>,
    cache: Arc<dyn ResourceCache>,
    metrics: Metrics,
    acme_queue: Option<FailureBackoffQueue<String>>,
    leadership: LeadershipHandle,
    acme_check_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Instance {
    pub fn new(
        options: InstanceOptions,
        process: Arc<dyn ProxyProcess>,
        cache: Arc<dyn ResourceCache>,
        metrics: Metrics,
        acme_queue: Option<FailureBackoffQueue<String>>,
        leadership: LeadershipHandle,
    ) -> Self {
        let files = ConfigFiles::new(&options.config_dir, options.max_old_config_files);
        Self {
            options,
            template: None,
            config: Mutex::new(ProxyConfig::default()),
            applied: Mutex::new(None),
            files: Mutex::new(files),
            process,
            cache,
            metrics,
            acme_queue,
            leadership,
            acme_check_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load and validate the configuration template. Without it no
    /// configuration can be rendered, callers treat a failure as fatal.
    pub fn parse_templates(&mut self) -> Result<()> {
        let template = Template::load(&self.options.templates_dir)?;
        info!("Using template {}", template.name());
        self.template = Some(template);
        Ok(())
    }

    /// The configuration model populated by the converter.
    /// Only the reconciliation handler writes to it.
    pub fn config(&self) -> MutexGuard<'_, ProxyConfig> {
        lock(&self.config)
    }

    /// Apply the current configuration model to the proxy. Failures are
    /// logged and the previously applied configuration stays live.
    pub async fn update(&self, timer: &mut Timer) {
        if let Err(e) = self.try_update(timer).await {
            error!("Failed to update proxy configuration: {}", e);
        }
    }

    async fn try_update(&self, timer: &mut Timer) -> Result<()> {
        let template = self.template.as_ref().ok_or_else(|| {
            ControllerError::TemplateError("templates were not parsed".to_string())
        })?;
        let desired = self.config().clone();
        let applied = lock(&self.applied).clone();

        match plan_update(applied.as_ref(), &desired) {
            UpdatePlan::Unchanged => {
                debug!("Proxy configuration unchanged");
                self.metrics.inc_update("unchanged", true);
                Ok(())
            }
            UpdatePlan::Dynamic(commands) => {
                let slots = applied.map(|a| a.slots).unwrap_or_default();
                match self.apply_dynamic(&commands).await {
                    Ok(()) => {
                        timer.tick("dynamic_update");
                        let state = AppliedState {
                            config: desired,
                            slots,
                        };
                        self.finish_dynamic(template, state, commands.len(), timer)
                            .await
                    }
                    Err(e) => {
                        warn!("Dynamic update failed, falling back to reload: {}", e);
                        self.metrics.inc_update("dynamic", false);
                        // the live proxy may be partially updated
                        *lock(&self.applied) = None;
                        self.reload(template, desired, None, "dynamic update failed", timer)
                            .await
                    }
                }
            }
            UpdatePlan::Reload(reason) => {
                let previous = lock(&self.applied).clone();
                self.reload(template, desired, previous.as_ref(), &reason, timer)
                    .await
            }
        }
    }

    async fn apply_dynamic(&self, commands: &[String]) -> Result<()> {
        for cmd in commands {
            let response = self.process.command(cmd).await?;
            if is_command_error(&response) {
                return Err(ControllerError::ProxyCommandError(format!(
                    "'{}': {}",
                    cmd,
                    response.trim()
                )));
            }
        }
        Ok(())
    }

    async fn finish_dynamic(
        &self,
        template: &Template,
        state: AppliedState,
        commands: usize,
        timer: &mut Timer,
    ) -> Result<()> {
        let path = self.write_config(template, &state)?;
        timer.tick("write_config");
        if self.options.validate_config {
            if let Err(e) = self.process.check_config(&path).await {
                *lock(&self.applied) = None;
                self.metrics.inc_update("dynamic", false);
                return Err(e);
            }
            timer.tick("validate_config");
        }
        *lock(&self.applied) = Some(state);
        self.metrics.inc_update("dynamic", true);
        info!("Proxy updated without reload, {} commands applied", commands);
        Ok(())
    }

    async fn reload(
        &self,
        template: &Template,
        desired: ProxyConfig,
        previous: Option<&AppliedState>,
        reason: &str,
        timer: &mut Timer,
    ) -> Result<()> {
        info!("Reloading proxy: {}", reason);
        let state = AppliedState::new(desired, previous);
        let path = self.write_config(template, &state)?;
        timer.tick("write_config");

        let result = match self.process.check_config(&path).await {
            Ok(()) => {
                timer.tick("check_config");
                self.process
                    .reload(self.options.reload_strategy, &path)
                    .await
            }
            Err(e) => Err(e),
        };

        self.metrics.inc_reload(result.is_ok());
        self.metrics.inc_update("reload", result.is_ok());
        result?;

        timer.tick("reload_haproxy");
        *lock(&self.applied) = Some(state);
        Ok(())
    }

    fn write_config(&self, template: &Template, state: &AppliedState) -> Result<PathBuf> {
        let mut files = lock(&self.files);
        let crt_list = files.write_aux(CRT_LIST_FILE, &render_crt_list(&state.config))?;
        let content = template.render(&RenderContext {
            config: &state.config,
            slots: &state.slots,
            admin_socket: &self.options.admin_socket,
            crt_list: &crt_list,
        });
        files.write(&content)
    }

    /// The configuration currently running in the proxy, if any
    pub fn applied(&self) -> Option<AppliedState> {
        lock(&self.applied).clone()
    }

    /// Sample the idle ratio of the proxy. Read only, may run alongside updates.
    pub async fn calc_idle_metric(&self) {
        match self.process.command("show info").await {
            Ok(info) => match parse_idle_pct(&info) {
                Some(pct) => self.metrics.set_proxy_idle(pct / 100.0),
                None => debug!("Idle_pct missing from proxy info"),
            },
            Err(e) => debug!("Failed to read proxy info: {}", e),
        }
    }

    /// Enqueue signing of missing, expiring or outdated ACME certificates.
    /// Concurrent calls run one after the other.
    pub async fn acme_check(&self, reason: &str) -> Result<usize> {
        let _guard = self.acme_check_lock.lock().await;
        let Some(queue) = &self.acme_queue else {
            return Err(ControllerError::AcmeDisabled);
        };
        self.metrics.inc_acme_check(reason);
        if !self.leadership.is_leader() {
            info!("Skipping acme check ({}), not the leader", reason);
            return Ok(0);
        }

        let certs = self.config().acme.clone();
        let mut count = 0;
        for (secret, domains) in &certs {
            let Some(why) = self.signing_reason(secret, domains) else {
                continue;
            };
            let domain_list: Vec<&str> = domains.iter().map(String::as_str).collect();
            info!("Enqueueing certificate {} ({}): {}", secret, why, domain_list.join(","));
            queue.add(format!("{},{}", secret, domain_list.join(",")));
            count += 1;
        }

        info!("Finished acme check ({}), {} certificate(s) enqueued", reason, count);
        Ok(count)
    }

    fn signing_reason(&self, secret: &str, domains: &BTreeSet<String>) -> Option<String> {
        let secret = match self.cache.secret(secret) {
            Ok(secret) => secret,
            Err(_) => return Some("certificate missing".to_string()),
        };
        let crt = secret
            .data
            .as_ref()
            .and_then(|d| d.get(TLS_CRT_KEY))
            .map(|b| b.0.as_slice());
        let Some(crt) = crt else {
            return Some("certificate missing".to_string());
        };
        let info = match parse_certificate(crt) {
            Ok(info) => info,
            Err(e) => return Some(format!("invalid certificate: {}", e)),
        };

        let expiring = chrono::Duration::from_std(self.options.acme_expiring)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        if info.not_after < Utc::now() + expiring {
            return Some(format!("expiring at {}", info.not_after));
        }
        if !info.covers(domains) {
            return Some("domain list changed".to_string());
        }
        None
    }
}

#[async_trait]
impl AcmeTrigger for Instance {
    async fn check(&self, reason: &str) -> Result<usize> {
        self.acme_check(reason).await
    }
}

/// HAProxy answers with a message on errors, and with informational
/// text for some successful `set server` commands
fn is_command_error(response: &str) -> bool {
    let response = response.to_lowercase();
    ["no such", "invalid", "error", "require", "unknown command"]
        .iter()
        .any(|marker| response.contains(marker))
}

fn parse_idle_pct(info: &str) -> Option<f64> {
    info.lines()
        .find_map(|line| line.strip_prefix("Idle_pct:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Path of the pid file kept next to the configuration
pub fn pid_file(config_dir: &Path) -> PathBuf {
    config_dir.join("haproxy.pid")
}
