// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Controller metrics and the per-reconciliation timer.

use crate::error::Result;
use prometheus::{Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::fmt::Write;
use std::time::{Duration, Instant};

/// Counters, histograms and gauges written by the controller core.
/// The core only records; exposition belongs to whoever owns the registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    proc_time: HistogramVec,
    updates: IntCounterVec,
    reloads: IntCounterVec,
    proxy_idle: Gauge,
    acme_checks: IntCounterVec,
    acme_signs: IntCounterVec,
    update_count: IntCounter,
}

impl Metrics {
    pub fn new(buckets: &[f64]) -> Result<Self> {
        let registry = Registry::new_custom(Some("haproxyingress".to_string()), None)?;

        let proc_time = HistogramVec::new(
            HistogramOpts::new(
                "controller_processing_seconds",
                "Time spent in each step of a configuration update",
            )
            .buckets(buckets.to_vec()),
            &["task"],
        )?;
        let updates = IntCounterVec::new(
            Opts::new("updates_total", "Proxy configuration updates by kind and result"),
            &["kind", "result"],
        )?;
        let reloads = IntCounterVec::new(
            Opts::new("reloads_total", "Proxy reloads by result"),
            &["result"],
        )?;
        let proxy_idle = Gauge::new("proxy_idle_ratio", "Last sampled idle ratio of the proxy")?;
        let acme_checks = IntCounterVec::new(
            Opts::new("acme_checks_total", "Certificate checks by trigger"),
            &["trigger"],
        )?;
        let acme_signs = IntCounterVec::new(
            Opts::new("acme_signs_total", "Certificate signing attempts by result"),
            &["result"],
        )?;
        let update_count = IntCounter::new(
            "controller_reconciliations_total",
            "Reconciliations started by the controller",
        )?;

        registry.register(Box::new(proc_time.clone()))?;
        registry.register(Box::new(updates.clone()))?;
        registry.register(Box::new(reloads.clone()))?;
        registry.register(Box::new(proxy_idle.clone()))?;
        registry.register(Box::new(acme_checks.clone()))?;
        registry.register(Box::new(acme_signs.clone()))?;
        registry.register(Box::new(update_count.clone()))?;

        Ok(Self {
            registry,
            proc_time,
            updates,
            reloads,
            proxy_idle,
            acme_checks,
            acme_signs,
            update_count,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start a timer whose ticks are observed into the processing time histogram
    pub fn timer(&self) -> Timer {
        Timer::new(self.proc_time.clone())
    }

    pub fn inc_update(&self, kind: &str, success: bool) {
        self.updates
            .with_label_values(&[kind, result_label(success)])
            .inc();
    }

    pub fn inc_reload(&self, success: bool) {
        self.reloads.with_label_values(&[result_label(success)]).inc();
    }

    pub fn set_proxy_idle(&self, ratio: f64) {
        self.proxy_idle.set(ratio);
    }

    pub fn proxy_idle(&self) -> f64 {
        self.proxy_idle.get()
    }

    pub fn inc_acme_check(&self, trigger: &str) {
        self.acme_checks.with_label_values(&[trigger]).inc();
    }

    pub fn inc_acme_sign(&self, success: bool) {
        self.acme_signs
            .with_label_values(&[result_label(success)])
            .inc();
    }

    pub fn acme_signs(&self, success: bool) -> u64 {
        self.acme_signs
            .with_label_values(&[result_label(success)])
            .get()
    }

    pub fn inc_reconciliation(&self) {
        self.update_count.inc();
    }

    pub fn reconciliations(&self) -> u64 {
        self.update_count.get()
    }

    pub fn updates(&self, kind: &str, success: bool) -> u64 {
        self.updates
            .with_label_values(&[kind, result_label(success)])
            .get()
    }
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Measures the steps of one reconciliation.
pub struct Timer {
    observer: HistogramVec,
    start: Instant,
    last: Instant,
    ticks: Vec<(String, Duration)>,
}

impl Timer {
    fn new(observer: HistogramVec) -> Self {
        let now = Instant::now();
        Self {
            observer,
            start: now,
            last: now,
            ticks: Vec::new(),
        }
    }

    /// Record the time elapsed since the previous tick under `task`
    pub fn tick(&mut self, task: &str) {
        let now = Instant::now();
        let elapsed = now - self.last;
        self.last = now;
        self.observer
            .with_label_values(&[task])
            .observe(elapsed.as_secs_f64());
        self.ticks.push((task.to_string(), elapsed));
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.ticks.iter().map(|(task, _)| task.as_str())
    }

    /// Render every tick plus the total under `total_label`
    pub fn as_string(&self, total_label: &str) -> String {
        let mut out = String::new();
        for (task, elapsed) in &self.ticks {
            let _ = write!(out, "{}={:?} ", task, elapsed);
        }
        let _ = write!(out, "{}={:?}", total_label, self.elapsed());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_ticks() {
        let metrics = Metrics::new(&[0.1, 1.0]).unwrap();
        let mut timer = metrics.timer();

        timer.tick("parse_ingress");
        timer.tick("write_config");

        let tasks: Vec<_> = timer.tasks().collect();
        assert_eq!(tasks, vec!["parse_ingress", "write_config"]);

        let out = timer.as_string("total");
        assert!(out.starts_with("parse_ingress="));
        assert!(out.contains(" write_config="));
        assert!(out.contains(" total="));
    }

    #[test]
    fn test_timer_observes_histogram() {
        let metrics = Metrics::new(&[0.1, 1.0]).unwrap();
        let mut timer = metrics.timer();
        timer.tick("reload");

        let histogram = metrics.proc_time.with_label_values(&["reload"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new(&[1.0]).unwrap();

        metrics.inc_update("dynamic", true);
        metrics.inc_update("dynamic", true);
        metrics.inc_update("reload", false);
        metrics.inc_acme_sign(false);

        assert_eq!(metrics.updates("dynamic", true), 2);
        assert_eq!(metrics.updates("reload", false), 1);
        assert_eq!(metrics.acme_signs(false), 1);
        assert_eq!(metrics.acme_signs(true), 0);
    }
}
