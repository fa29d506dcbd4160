// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Kubernetes annotation keys read by the controller
pub mod annotations {
    /// Legacy ingress class selector
    pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
    /// When set to "true" and TLS annotation tracking is enabled, the TLS secret is signed by ACME
    pub const TLS_ACME: &str = "kubernetes.io/tls-acme";
    /// Suffix appended to the annotation prefix, value "acme" enables certificate signing
    pub const CERT_SIGNER: &str = "cert-signer";
    /// Value of the cert-signer annotation that requests ACME signing
    pub const CERT_SIGNER_ACME: &str = "acme";
}

/// The controller name used for server-side apply and logs
pub const OPERATOR_NAME: &str = "haproxy-ingress";

/// Human readable controller name
pub const CONTROLLER_NAME: &str = "HAProxy Ingress Controller";

/// Ingress class used when none is configured
pub const DEFAULT_INGRESS_CLASS: &str = "haproxy";

/// Work queue key that triggers a full reconciliation
pub const RESYNC_KEY: &str = "resync";

/// Leader election timings, mirroring the client-go defaults
pub mod lease {
    use std::time::Duration;

    /// How long a lease is valid without renewal
    pub const LEASE_DURATION: Duration = Duration::from_secs(15);
    /// How long the leader keeps retrying a failed renewal before giving up
    pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
    /// Interval between acquire/renew attempts
    pub const RETRY_PERIOD: Duration = Duration::from_secs(2);
}

/// ACME related defaults
pub mod acme {
    /// Jitter applied on top of the periodic ACME check period
    pub const CHECK_JITTER_FACTOR: f64 = 0.1;
    /// Secret data keys holding the signed certificate and its key
    pub const TLS_CRT_KEY: &str = "tls.crt";
    pub const TLS_KEY_KEY: &str = "tls.key";
}

/// Proxy process related constants
pub mod proxy {
    /// Main template file, rendered to the proxy configuration
    pub const MAIN_TEMPLATE: &str = "haproxy.tmpl";
    /// Name of the non-timestamped configuration file
    pub const CONFIG_FILE: &str = "haproxy.cfg";
    /// Server slots are allocated in blocks of this size, endpoint changes within
    /// the allocated slots are applied dynamically
    pub const SLOTS_INCREMENT: usize = 8;
}
