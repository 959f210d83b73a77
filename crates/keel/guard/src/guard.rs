use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::config::{CircuitBreakerConfig, RateLimitConfig};
use crate::error::Result;
use crate::lock::DistributedLock;
use crate::rate_limit::{QuotaOutcome, RateLimiter};
use keel_storage::KeyValueStore;
use keel_types::{EngineId, TenantId};
use std::sync::Arc;

/// Quota, breaker and lock primitives behind one handle.
pub struct ResourceGuard {
    limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    lock: Arc<DistributedLock>,
}

impl ResourceGuard {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        rate_limits: RateLimitConfig,
        circuit_breaker: CircuitBreakerConfig,
    ) -> Result<Self> {
        rate_limits.validate()?;
        circuit_breaker.validate()?;
        Ok(Self {
            limiter: RateLimiter::new(store.clone(), rate_limits),
            breakers: CircuitBreakerRegistry::new(circuit_breaker),
            lock: Arc::new(DistributedLock::new(store)),
        })
    }

    pub async fn check_quota(&self, tenant_id: &TenantId, engine_id: &EngineId) -> Result<QuotaOutcome> {
        self.limiter.check(tenant_id, engine_id).await
    }

    pub fn breaker(&self, engine_id: &EngineId) -> Arc<CircuitBreaker> {
        self.breakers.breaker(engine_id)
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.lock
    }
}
