//! Provider health probes.
//!
//! A probe is the smallest possible completion: one "ping" user message with
//! max_tokens=1 under a 30 second deadline. Probes go straight to the
//! transport so pending and unhealthy providers can be re-validated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::protocol::ChatRequest;
use crate::registry::{ProviderRegistry, RegistryError, Result};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HealthProber {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe one provider and record the result. Returns whether the
    /// provider is usable afterwards.
    pub async fn probe(&self, provider_id: &str) -> Result<bool> {
        let provider = self.registry.get(provider_id)?;
        let transport = self.registry.transport();

        match transport
            .chat(&provider, &ChatRequest::ping(), self.timeout)
            .await
        {
            Ok(resp) => {
                debug!(provider = %provider_id, latency_ms = resp.latency.as_millis() as u64, "probe ok");
                self.registry
                    .record_success(provider_id, resp.latency)
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "probe failed");
                self.registry
                    .record_failure(provider_id, &e.to_string())
                    .await?;
                Ok(self.registry.get(provider_id)?.status.is_usable())
            }
        }
    }

    /// Probe every registered provider; returns the IDs that came back
    /// usable. Individual probe errors are recorded, not propagated.
    pub async fn probe_all(&self) -> Vec<String> {
        let mut usable = Vec::new();
        for provider in self.registry.list() {
            match self.probe(&provider.id).await {
                Ok(true) => usable.push(provider.id),
                Ok(false) => {}
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => {
                    warn!(provider = %provider.id, error = %e, "probe bookkeeping failed");
                }
            }
        }
        usable
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
