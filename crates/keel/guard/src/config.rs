use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Quota for one layer: at most `max` calls per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerLimit {
    pub max: u64,
    pub window_ms: u64,
}

impl LayerLimit {
    pub const fn new(max: u64, window_ms: u64) -> Self {
        Self { max, window_ms }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global: LayerLimit,
    /// Applied to each tenant separately.
    pub tenant: LayerLimit,
    /// Applied to each engine separately.
    pub engine: LayerLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: LayerLimit::new(10_000, 1_000),
            tenant: LayerLimit::new(1_000, 60_000),
            engine: LayerLimit::new(500, 60_000),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, limit) in [
            ("global", &self.global),
            ("tenant", &self.tenant),
            ("engine", &self.engine),
        ] {
            if limit.max == 0 || limit.window_ms == 0 {
                return Err(GuardError::InvalidConfig(format!(
                    "rate limit layer {name} needs a non-zero max and window"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting one trial call.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GuardError::InvalidConfig(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.cooldown_ms == 0 {
            return Err(GuardError::InvalidConfig(
                "circuit breaker cooldown_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = RateLimitConfig::default();
        assert!(config.validate().is_ok());
        config.tenant.window_ms = 0;
        assert!(config.validate().is_err());

        let breaker = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(breaker.validate().is_err());
    }
}
