//! Provider registry: shared-mutable set of LLM endpoints.
//!
//! Reads dominate (every executor iteration looks up its agent's provider),
//! so the map sits behind an `RwLock`. Writes go only through register,
//! update, unregister, and the probe-driven status transitions. Every chat
//! call reports through the optional metrics callback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use loom_bus::EventBus;
use loom_core::cache::CacheDb;
use loom_core::types::{Event, Heartbeat, Provider, ProviderStatus};
use thiserror::Error;
use tracing::{info, warn};

use crate::protocol::{ChatProtocol, ChatRequest, ChatResponse, HttpTransport, ProtocolError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider not found: {0}")]
    NotFound(String),
    #[error("provider {0} is not usable (status {1})")]
    Unavailable(String, String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transient registry error: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Per-call record handed to the metrics callback.
#[derive(Debug, Clone)]
pub struct ChatMetrics {
    pub provider_id: String,
    pub success: bool,
    pub latency: Duration,
    pub total_tokens: u64,
}

pub type MetricsCallback = Arc<dyn Fn(&ChatMetrics) + Send + Sync>;

/// Consecutive failures before active -> unhealthy.
const UNHEALTHY_AFTER: u32 = 2;

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Provider>>,
    /// Consecutive probe/call failures per provider.
    failures: RwLock<HashMap<String, u32>>,
    metrics: RwLock<Option<MetricsCallback>>,
    transport: Arc<dyn ChatProtocol>,
    cache: Arc<CacheDb>,
    bus: EventBus,
    chat_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(cache: Arc<CacheDb>, bus: EventBus, chat_timeout: Duration) -> Self {
        Self::with_transport(cache, bus, chat_timeout, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(
        cache: Arc<CacheDb>,
        bus: EventBus,
        chat_timeout: Duration,
        transport: Arc<dyn ChatProtocol>,
    ) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            metrics: RwLock::new(None),
            transport,
            cache,
            bus,
            chat_timeout,
        }
    }

    pub fn transport(&self) -> Arc<dyn ChatProtocol> {
        Arc::clone(&self.transport)
    }

    /// Rehydrate registered providers. Restored providers come back as
    /// pending; a probe must re-activate them.
    pub async fn load_from_cache(&self) -> Result<usize> {
        let records = self
            .cache
            .list_providers()
            .await
            .map_err(|e| RegistryError::Transient(e.to_string()))?;
        let count = records.len();
        let mut providers = self.providers.write().expect("registry lock poisoned");
        for mut provider in records {
            provider.status = ProviderStatus::Pending;
            providers.insert(provider.id.clone(), provider);
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub async fn register(&self, mut provider: Provider) -> Result<()> {
        provider.status = ProviderStatus::Pending;
        {
            let mut providers = self.providers.write().expect("registry lock poisoned");
            providers.insert(provider.id.clone(), provider.clone());
        }
        self.persist(&provider).await?;
        info!(provider = %provider.id, endpoint = %provider.endpoint, "provider registered");
        Ok(())
    }

    /// Replace a provider's configuration. Status resets to pending so the
    /// next probe re-validates the new endpoint.
    pub async fn update(&self, mut provider: Provider) -> Result<()> {
        {
            let providers = self.providers.read().expect("registry lock poisoned");
            if !providers.contains_key(&provider.id) {
                return Err(RegistryError::NotFound(provider.id.clone()));
            }
        }
        provider.status = ProviderStatus::Pending;
        {
            let mut providers = self.providers.write().expect("registry lock poisoned");
            providers.insert(provider.id.clone(), provider.clone());
        }
        self.failures
            .write()
            .expect("registry lock poisoned")
            .remove(&provider.id);
        self.persist(&provider).await
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        let removed = {
            let mut providers = self.providers.write().expect("registry lock poisoned");
            providers.remove(id)
        };
        if removed.is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.cache
            .delete_provider(id)
            .await
            .map_err(|e| RegistryError::Transient(e.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Provider> {
        let providers = self.providers.read().expect("registry lock poisoned");
        providers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Provider> {
        let providers = self.providers.read().expect("registry lock poisoned");
        providers.values().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<Provider> {
        let providers = self.providers.read().expect("registry lock poisoned");
        providers
            .values()
            .filter(|p| p.status.is_usable())
            .cloned()
            .collect()
    }

    pub fn set_metrics_callback(&self, callback: MetricsCallback) {
        *self.metrics.write().expect("registry lock poisoned") = Some(callback);
    }

    // -----------------------------------------------------------------------
    // Chat passthrough
    // -----------------------------------------------------------------------

    /// Send a chat completion through the named provider and report the
    /// outcome to the metrics callback and the health tracker.
    pub async fn chat(&self, provider_id: &str, request: &ChatRequest) -> Result<ChatResponse> {
        let provider = self.get(provider_id)?;
        if !provider.status.is_usable() {
            return Err(RegistryError::Unavailable(
                provider_id.to_string(),
                format!("{:?}", provider.status),
            ));
        }

        let result = self
            .transport
            .chat(&provider, request, self.chat_timeout)
            .await;

        match &result {
            Ok(resp) => {
                self.emit_metrics(ChatMetrics {
                    provider_id: provider_id.to_string(),
                    success: true,
                    latency: resp.latency,
                    total_tokens: resp.total_tokens,
                });
                self.record_success(provider_id, resp.latency).await?;
            }
            Err(e) => {
                self.emit_metrics(ChatMetrics {
                    provider_id: provider_id.to_string(),
                    success: false,
                    latency: Duration::ZERO,
                    total_tokens: 0,
                });
                self.record_failure(provider_id, &e.to_string()).await?;
            }
        }
        result.map_err(RegistryError::Protocol)
    }

    // -----------------------------------------------------------------------
    // Health transitions (driven by probes and live calls)
    // -----------------------------------------------------------------------

    /// A successful completion: pending or unhealthy providers activate
    /// immediately, the failure streak resets.
    pub async fn record_success(&self, id: &str, latency: Duration) -> Result<()> {
        let (updated, activated) = {
            let mut providers = self.providers.write().expect("registry lock poisoned");
            let provider = providers
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let was_usable = provider.status.is_usable();
            provider.status = ProviderStatus::Active;
            provider.last_heartbeat = Some(Heartbeat {
                at: Utc::now(),
                latency_ms: latency.as_millis() as u64,
                error: None,
            });
            (provider.clone(), !was_usable)
        };
        self.failures
            .write()
            .expect("registry lock poisoned")
            .remove(id);
        self.persist(&updated).await?;
        if activated {
            info!(provider = %id, "provider activated");
            self.bus.publish(
                Event::new("provider_activated", "provider_registry")
                    .with_data("provider_id", id),
            );
        }
        Ok(())
    }

    /// A failed completion or probe: two consecutive failures downgrade an
    /// active provider to unhealthy.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<()> {
        let streak = {
            let mut failures = self.failures.write().expect("registry lock poisoned");
            let streak = failures.entry(id.to_string()).or_insert(0);
            *streak += 1;
            *streak
        };
        let updated = {
            let mut providers = self.providers.write().expect("registry lock poisoned");
            let provider = providers
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            provider.last_heartbeat = Some(Heartbeat {
                at: Utc::now(),
                latency_ms: 0,
                error: Some(error.to_string()),
            });
            if streak >= UNHEALTHY_AFTER && provider.status.is_usable() {
                provider.status = ProviderStatus::Unhealthy;
                warn!(provider = %id, streak, "provider marked unhealthy");
                self.bus.publish(
                    Event::new("provider_unhealthy", "provider_registry")
                        .with_data("provider_id", id)
                        .with_data("error", error),
                );
            }
            provider.clone()
        };
        self.persist(&updated).await
    }

    async fn persist(&self, provider: &Provider) -> Result<()> {
        self.cache
            .upsert_provider(provider)
            .await
            .map_err(|e| RegistryError::Transient(e.to_string()))
    }

    fn emit_metrics(&self, metrics: ChatMetrics) {
        if let Some(callback) = self.metrics.read().expect("registry lock poisoned").as_ref() {
            callback(&metrics);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
