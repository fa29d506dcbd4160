// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Handles signing requests taken from the failure backoff queue.

use crate::cache::ResourceCache;
use crate::error::{ControllerError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub crt_pem: String,
    pub key_pem: String,
}

/// Issues certificates for a list of domains
#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn sign(&self, domains: &[String]) -> Result<SignedCertificate>;
}

/// Client used when no ACME account is configured, every request fails
/// and is retried with backoff
pub struct UnconfiguredAcmeClient;

#[async_trait]
impl AcmeClient for UnconfiguredAcmeClient {
    async fn sign(&self, domains: &[String]) -> Result<SignedCertificate> {
        Err(ControllerError::SignerError(format!(
            "no ACME account configured, cannot sign {}",
            domains.join(",")
        )))
    }
}

/// A queue item: `<namespace>/<secret>,<domain>[,<domain>...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pub secret: String,
    pub domains: Vec<String>,
}

impl SigningRequest {
    pub fn parse(item: &str) -> Result<Self> {
        let mut parts = item.split(',').map(str::trim).filter(|p| !p.is_empty());
        let secret = parts
            .next()
            .filter(|s| s.contains('/'))
            .ok_or_else(|| {
                ControllerError::SignerError(format!("Invalid signing item '{}'", item))
            })?;
        let domains: Vec<String> = parts.map(str::to_string).collect();
        if domains.is_empty() {
            return Err(ControllerError::SignerError(format!(
                "No domains in signing item '{}'",
                item
            )));
        }
        Ok(Self {
            secret: secret.to_string(),
            domains,
        })
    }
}

pub struct Signer {
    client: Arc<dyn AcmeClient>,
    cache: Arc<dyn ResourceCache>,
    metrics: Metrics,
}

impl Signer {
    pub fn new(
        client: Arc<dyn AcmeClient>,
        cache: Arc<dyn ResourceCache>,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            cache,
            metrics,
        }
    }

    /// Sign and store the certificate of one queue item. An error schedules a retry.
    /// Nothing is stored once `leading` is cancelled.
    #[instrument(skip(self, leading))]
    pub async fn notify(&self, item: &str, leading: &CancellationToken) -> Result<()> {
        let request = match SigningRequest::parse(item) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping signing request: {}", e);
                return Ok(());
            }
        };

        let signed = tokio::select! {
            biased;
            _ = leading.cancelled() => {
                info!("Leadership lost, abandoning signing of {}", request.secret);
                return Ok(());
            }
            signed = self.client.sign(&request.domains) => signed,
        };
        let signed = match signed {
            Ok(signed) => signed,
            Err(e) => {
                self.metrics.inc_acme_sign(false);
                return Err(e);
            }
        };

        if leading.is_cancelled() {
            info!("Leadership lost, not storing certificate {}", request.secret);
            return Ok(());
        }
        let stored = self
            .cache
            .store_certificate(&request.secret, &signed.crt_pem, &signed.key_pem)
            .await;
        self.metrics.inc_acme_sign(stored.is_ok());
        stored?;

        info!(
            "Signed certificate {} for {}",
            request.secret,
            request.domains.join(",")
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeAcmeClient, FakeCache};

    fn signer(client: Arc<FakeAcmeClient>, cache: Arc<FakeCache>) -> (Signer, Metrics) {
        let metrics = Metrics::new(&[1.0]).unwrap();
        (Signer::new(client, cache, metrics.clone()), metrics)
    }

    #[test]
    fn test_parse_request() {
        let request = SigningRequest::parse("default/tls,a.example.com,b.example.com").unwrap();
        assert_eq!(request.secret, "default/tls");
        assert_eq!(request.domains, vec!["a.example.com", "b.example.com"]);

        assert!(SigningRequest::parse("default/tls").is_err());
        assert!(SigningRequest::parse("tls,a.example.com").is_err());
        assert!(SigningRequest::parse("").is_err());
    }

    #[tokio::test]
    async fn test_notify_stores_certificate() {
        let cache = Arc::new(FakeCache::default());
        let (signer, metrics) = signer(Arc::new(FakeAcmeClient::default()), cache.clone());

        signer
            .notify("default/tls,a.example.com", &CancellationToken::new())
            .await
            .unwrap();

        let stored = cache.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "default/tls");
        assert_eq!(metrics.acme_signs(true), 1);
    }

    #[tokio::test]
    async fn test_notify_failure_is_reported() {
        let cache = Arc::new(FakeCache::default());
        let client = Arc::new(FakeAcmeClient::default());
        client.set_failing(true);
        let (signer, metrics) = signer(client, cache.clone());

        let result = signer
            .notify("default/tls,a.example.com", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ControllerError::SignerError(_))));
        assert!(cache.stored().is_empty());
        assert_eq!(metrics.acme_signs(false), 1);
    }

    #[tokio::test]
    async fn test_notify_after_leadership_lost_does_nothing() {
        let cache = Arc::new(FakeCache::default());
        let client = Arc::new(FakeAcmeClient::default());
        let (signer, _) = signer(client.clone(), cache.clone());
        let leading = CancellationToken::new();
        leading.cancel();

        signer.notify("default/tls,a.example.com", &leading).await.unwrap();

        assert!(cache.stored().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_item_is_dropped() {
        let cache = Arc::new(FakeCache::default());
        let client = Arc::new(FakeAcmeClient::default());
        let (signer, _) = signer(client.clone(), cache);

        signer.notify("garbage", &CancellationToken::new()).await.unwrap();

        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails() {
        let err = UnconfiguredAcmeClient
            .sign(&["a.example.com".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("a.example.com"));
    }
}
