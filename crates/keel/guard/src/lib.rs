//! Keel Guard - resource protection for governed calls.
//!
//! Three independent primitives, combined by [`ResourceGuard`]:
//! - [`RateLimiter`]: global → tenant → engine windowed quotas, fail fast
//! - [`CircuitBreakerRegistry`]: one breaker per engine over consecutive failures
//! - [`DistributedLock`]: TTL-bounded mutual exclusion over a shared store
//!
//! Counters and locks live in a [`keel_storage::KeyValueStore`], so several
//! kernel processes sharing one store share quotas and locks. Breakers are
//! process-local.

#![deny(unsafe_code)]

mod circuit_breaker;
mod config;
mod error;
mod guard;
mod lock;
mod rate_limit;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::{CircuitBreakerConfig, LayerLimit, RateLimitConfig};
pub use error::{GuardError, Result};
pub use guard::ResourceGuard;
pub use lock::DistributedLock;
pub use rate_limit::{QuotaOutcome, RateLimitDecision, RateLimitLayer, RateLimiter};
