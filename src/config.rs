// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::DEFAULT_INGRESS_CLASS;
use crate::error::{ControllerError, Result};
use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Controller configuration loaded from command line flags and environment variables
#[derive(Parser, Debug, Clone)]
#[command(name = "haproxy-ingress", version, about = "HAProxy Ingress Controller")]
pub struct Config {
    /// Name of the ingress class this controller satisfies
    #[arg(long, env = "INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,

    /// Also process ingress resources that do not declare any ingress class
    #[arg(long)]
    pub watch_ingress_without_class: bool,

    /// Name of the reload strategy. Options are: native or reusesocket (default)
    #[arg(long, default_value = "reusesocket")]
    pub reload_strategy: String,

    /// Maximum old haproxy timestamped config files to allow before being cleaned up.
    /// A value <= 0 indicates a single non-timestamped config file will be used
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub max_old_config_files: i32,

    /// Validate the resulting configuration files also when a dynamic update was applied.
    /// When false the validation only happens when HAProxy needs to be reloaded
    #[arg(long)]
    pub validate_config: bool,

    /// Maximum number of configuration updates per second
    #[arg(long, default_value_t = 0.5)]
    pub rate_limit_update: f32,

    /// Allow TLS secrets to be referenced from ingress resources of other namespaces
    #[arg(long)]
    pub allow_cross_namespace: bool,

    /// Default backend service in the form namespace/name:port
    #[arg(long)]
    pub default_backend_service: Option<String>,

    /// Secret in the form namespace/name used as the default TLS certificate
    #[arg(long)]
    pub default_ssl_certificate: Option<String>,

    /// Prefix of the annotations read by this controller
    #[arg(long, default_value = "haproxy-ingress.github.io")]
    pub annotations_prefix: String,

    /// Enable ACME certificate signing
    #[arg(long)]
    pub acme_server: bool,

    /// Prefix of the leader election id, the ingress class is appended to it
    #[arg(long, default_value = "acme-leader")]
    pub acme_election_id: String,

    /// Time between checks of invalid or expiring certificates
    #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
    pub acme_check_period: Duration,

    /// Initial retry delay of a failed certificate signing
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub acme_fail_initial_duration: Duration,

    /// Maximum retry delay of a failing certificate signing
    #[arg(long, default_value = "72h", value_parser = humantime::parse_duration)]
    pub acme_fail_max_duration: Duration,

    /// Certificates expiring within this period are signed again
    #[arg(long, default_value = "30days", value_parser = humantime::parse_duration)]
    pub acme_expiring: Duration,

    /// Also sign TLS secrets of ingress resources annotated with kubernetes.io/tls-acme
    #[arg(long)]
    pub acme_track_tls_annotation: bool,

    /// Control socket used to trigger external certificate checks
    #[arg(long, default_value = "/var/run/haproxy/acme.sock")]
    pub acme_socket: PathBuf,

    /// Interval between proxy idle samples, zero disables the sampling
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub stats_collect_processing_period: Duration,

    /// Seconds to wait before stopping the controller components on shutdown
    #[arg(long, default_value_t = 0)]
    pub wait_before_shutdown: u64,

    /// Buckets of the processing time histogram, in seconds
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0.0005,0.001,0.002,0.005,0.01,0.05,0.1,0.5,1"
    )]
    pub buckets_response_time: Vec<f64>,

    /// Directory of the generated proxy configuration files
    #[arg(long, default_value = "/etc/haproxy")]
    pub haproxy_config_dir: PathBuf,

    /// Directory of the configuration templates
    #[arg(long, default_value = "/etc/templates/haproxy")]
    pub templates_dir: PathBuf,

    /// Directory of the generated certificate files
    #[arg(long, default_value = "/var/lib/haproxy/ssl")]
    pub ssl_dir: PathBuf,

    /// Path of the haproxy executable
    #[arg(long, default_value = "haproxy")]
    pub haproxy_binary: PathBuf,

    /// Runtime API socket of the running proxy
    #[arg(long, default_value = "/var/run/haproxy/admin.sock")]
    pub admin_socket: PathBuf,

    /// Master CLI socket, reloads go through it when configured
    #[arg(long)]
    pub master_socket: Option<PathBuf>,

    /// Name of this replica, used as the leader election identity
    #[arg(long, env = "POD_NAME", default_value = "haproxy-ingress")]
    pub pod_name: String,

    /// Namespace of this replica, holds the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,
}

impl Config {
    /// Resolve the configured reload strategy, failing on unsupported values
    pub fn reload_strategy(&self) -> Result<ReloadStrategy> {
        ReloadStrategy::from_flag(&self.reload_strategy)
    }

    /// Leader election id, unique per ingress class
    pub fn election_id(&self) -> String {
        format!("{}-{}", self.acme_election_id, self.ingress_class)
    }

    /// Minimum interval between two reconciliations, derived from the update rate
    pub fn rate_limit_interval(&self) -> Result<Duration> {
        if self.rate_limit_update > 0.0 {
            Duration::try_from_secs_f32(1.0 / self.rate_limit_update).map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "--rate-limit-update {} is out of range: {}",
                    self.rate_limit_update, e
                ))
            })
        } else {
            Ok(Duration::ZERO)
        }
    }

    pub fn dynamic_config(&self) -> DynamicConfig {
        DynamicConfig {
            static_cross_namespace_secrets: self.allow_cross_namespace,
        }
    }
}

/// Mechanism used to apply a new configuration to the running proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// Start a new process and let the old one finish its connections
    Native,
    /// Like native, but listening sockets are handed over to the new process
    ReuseSocket,
}

/// Deprecated flag values: legacy value, canonical strategy, warning
const DEPRECATED_STRATEGIES: &[(&str, ReloadStrategy, &str)] = &[(
    "multibinder",
    ReloadStrategy::ReuseSocket,
    "multibinder is deprecated, using reusesocket strategy instead. update your deployment configuration",
)];

impl ReloadStrategy {
    pub fn from_flag(value: &str) -> Result<Self> {
        match value {
            "native" => return Ok(ReloadStrategy::Native),
            "reusesocket" => return Ok(ReloadStrategy::ReuseSocket),
            _ => {}
        }
        match DEPRECATED_STRATEGIES
            .iter()
            .find(|(legacy, _, _)| *legacy == value)
        {
            Some((_, strategy, warning)) => {
                warn!("{}", warning);
                Ok(*strategy)
            }
            None => Err(ControllerError::UnsupportedReloadStrategy(value.to_string())),
        }
    }
}

impl fmt::Display for ReloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadStrategy::Native => write!(f, "native"),
            ReloadStrategy::ReuseSocket => write!(f, "reusesocket"),
        }
    }
}

/// Process wide settings derived once from the operator configuration
#[derive(Debug, Clone, Default)]
pub struct DynamicConfig {
    /// Whether TLS secrets may be referenced across namespaces
    pub static_cross_namespace_secrets: bool,
}
