use crate::config::{LayerLimit, RateLimitConfig};
use crate::error::Result;
use keel_storage::KeyValueStore;
use keel_types::{EngineId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitLayer {
    Global,
    Tenant,
    Engine,
}

impl RateLimitLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitLayer::Global => "global",
            RateLimitLayer::Tenant => "tenant",
            RateLimitLayer::Engine => "engine",
        }
    }
}

impl fmt::Display for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub layer: RateLimitLayer,
    pub allowed: bool,
    pub remaining: u64,
    pub reset_ms: u64,
}

/// Per-layer decisions in evaluation order. Stops at the first rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOutcome {
    pub decisions: Vec<RateLimitDecision>,
}

impl QuotaOutcome {
    pub fn allowed(&self) -> bool {
        self.decisions.iter().all(|d| d.allowed)
    }

    pub fn rejected(&self) -> Option<&RateLimitDecision> {
        self.decisions.iter().find(|d| !d.allowed)
    }
}

/// Layered windowed rate limiter over a shared counter store.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one call against global, tenant and engine quotas in that order.
    /// Later layers are not touched once a layer rejects.
    pub async fn check(&self, tenant_id: &TenantId, engine_id: &EngineId) -> Result<QuotaOutcome> {
        let layers = [
            (RateLimitLayer::Global, "all", self.config.global),
            (RateLimitLayer::Tenant, tenant_id.as_str(), self.config.tenant),
            (RateLimitLayer::Engine, engine_id.as_str(), self.config.engine),
        ];

        let mut decisions = Vec::with_capacity(layers.len());
        for (layer, key, limit) in layers {
            let decision = self.check_layer(layer, key, limit).await?;
            let allowed = decision.allowed;
            decisions.push(decision);
            if !allowed {
                tracing::info!(
                    layer = %layer,
                    tenant_id = %tenant_id,
                    engine_id = %engine_id,
                    "rate limit exceeded"
                );
                break;
            }
        }
        Ok(QuotaOutcome { decisions })
    }

    async fn check_layer(
        &self,
        layer: RateLimitLayer,
        key: &str,
        limit: LayerLimit,
    ) -> Result<RateLimitDecision> {
        let bucket = format!("keel:ratelimit:{}:{}", layer.as_str(), key);
        let counted = self.store.increment_window(&bucket, limit.window()).await?;
        Ok(RateLimitDecision {
            layer,
            allowed: counted.count <= limit.max,
            remaining: limit.max.saturating_sub(counted.count),
            reset_ms: u64::try_from(counted.reset_after.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_storage::InMemoryStorage;
    use std::time::Duration;

    fn limiter(tenant_max: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryStorage::new()),
            RateLimitConfig {
                global: LayerLimit::new(1_000, 60_000),
                tenant: LayerLimit::new(tenant_max, 60_000),
                engine: LayerLimit::new(1_000, 60_000),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_call_is_denied_then_window_resets() {
        let limiter = limiter(5);
        let tenant = TenantId::new("t-1");
        let engine = EngineId::new("accounting");

        for _ in 0..5 {
            assert!(limiter.check(&tenant, &engine).await.unwrap().allowed());
        }
        let outcome = limiter.check(&tenant, &engine).await.unwrap();
        let rejected = outcome.rejected().unwrap();
        assert_eq!(rejected.layer, RateLimitLayer::Tenant);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.reset_ms <= 60_000);
        // engine layer was never evaluated
        assert_eq!(outcome.decisions.len(), 2);

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(limiter.check(&tenant, &engine).await.unwrap().allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn tenants_have_separate_buckets() {
        let limiter = limiter(1);
        let engine = EngineId::new("accounting");
        assert!(limiter.check(&TenantId::new("a"), &engine).await.unwrap().allowed());
        assert!(!limiter.check(&TenantId::new("a"), &engine).await.unwrap().allowed());
        assert!(limiter.check(&TenantId::new("b"), &engine).await.unwrap().allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let limiter = limiter(3);
        let tenant = TenantId::new("t-1");
        let engine = EngineId::new("accounting");
        let first = limiter.check(&tenant, &engine).await.unwrap();
        assert_eq!(first.decisions[1].remaining, 2);
        assert_eq!(first.decisions[1].reset_ms, 60_000);
    }
}
