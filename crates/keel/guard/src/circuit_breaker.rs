//! Per-engine circuit breakers.
//!
//! Closed counts consecutive failures and opens at the threshold. Open
//! short-circuits every call until the cooldown has elapsed, then the breaker
//! half-opens and admits exactly one trial call. The trial's outcome closes or
//! re-opens it.

use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use keel_types::EngineId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub engine_id: EngineId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    engine_id: EngineId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(engine_id: EngineId, config: CircuitBreakerConfig) -> Self {
        Self {
            engine_id,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn engine_id(&self) -> &EngineId {
        &self.engine_id
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may proceed. In half-open only the first caller is
    /// admitted; it must report back through `record_success`,
    /// `record_failure` or `release`.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    debug!(engine_id = %self.engine_id, "circuit breaker admitting trial call");
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!(engine_id = %self.engine_id, "circuit breaker closing after successful trial");
                Self::transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {
                debug!(engine_id = %self.engine_id, "success recorded while circuit open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        engine_id = %self.engine_id,
                        failures = inner.consecutive_failures,
                        "circuit breaker opening due to failures"
                    );
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(engine_id = %self.engine_id, "circuit breaker re-opening after failed trial");
                Self::transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Hand back an admission that never reached the engine. Frees the
    /// half-open trial slot; a no-op in other states.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        Self::transition(&mut inner, CircuitState::Closed);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            engine_id: self.engine_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // plain data with no partial updates; recover from poisoning
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.cooldown());
        if cooled {
            info!(engine_id = %self.engine_id, "circuit breaker half-open after cooldown");
            Self::transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(inner: &mut BreakerInner, next: CircuitState) {
        inner.state = next;
        inner.trial_in_flight = false;
        match next {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
        }
    }
}

/// Lazily created breaker per engine.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<EngineId, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, engine_id: &EngineId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(engine_id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(engine_id.clone(), self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.engine_id.cmp(&b.engine_id));
        snapshots
    }
}
