// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Unsupported reload strategy: {0}")]
    UnsupportedReloadStrategy(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Failed to bind acme socket {path}: {source}")]
    AcmeSocketError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy command failed: {0}")]
    ProxyCommandError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Cross namespace secret reference is not allowed: {0}")]
    CrossNamespaceSecret(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Certificate signing failed: {0}")]
    SignerError(String),

    #[error("ACME certificate signing is disabled")]
    AcmeDisabled,

    #[error("Leader election error: {0}")]
    LeaseError(String),

    #[error("Conversion failed: {0}")]
    ConversionError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
