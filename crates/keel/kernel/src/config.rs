//! Configuration for the keel kernel

use crate::error::{KernelError, Result};
use keel_guard::{CircuitBreakerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable prefix, e.g. `KEEL_TELEMETRY__LOG_LEVEL=debug`.
pub const ENV_PREFIX: &str = "KEEL";

/// Main kernel configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Default execution token lifetime. Also bounds how long a rotated-out
    /// signing key keeps verifying.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_ms: u64,

    /// Consumed nonces remembered before the set is trimmed.
    #[serde(default = "default_nonce_capacity")]
    pub nonce_capacity: usize,

    /// Registered identity chains kept in memory.
    #[serde(default = "default_chain_capacity")]
    pub chain_capacity: usize,

    /// Reject invocations that carry no execution token.
    #[serde(default)]
    pub require_token: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: default_token_ttl(),
            nonce_capacity: default_nonce_capacity(),
            chain_capacity: default_chain_capacity(),
            require_token: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Handler deadline unless the contract declares its own.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Entries held in memory when the audit store rejects a write.
    #[serde(default = "default_fallback_capacity")]
    pub fallback_capacity: usize,

    /// Serialize appends across processes sharing the cache store.
    #[serde(default)]
    pub distributed_lock: bool,

    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            fallback_capacity: default_fallback_capacity(),
            distributed_lock: false,
            lock_ttl_ms: default_lock_ttl(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_token_ttl() -> u64 {
    5 * 60 * 1000
}

fn default_nonce_capacity() -> usize {
    10_000
}

fn default_chain_capacity() -> usize {
    10_000
}

fn default_execution_timeout() -> u64 {
    30_000
}

fn default_cache_ttl() -> u64 {
    30_000
}

fn default_fallback_capacity() -> usize {
    1_000
}

fn default_lock_ttl() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KernelConfig {
    /// Load configuration: defaults, then the optional file, then `KEEL_*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`KernelConfig::load`], reading variables from `env` instead of
    /// the process environment when given.
    pub fn load_with_env(path: Option<&str>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&KernelConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Double underscore separates sections, so field names keep theirs.
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: KernelConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limits
            .validate()
            .map_err(|e| KernelError::InvalidConfig(e.to_string()))?;
        self.circuit_breaker
            .validate()
            .map_err(|e| KernelError::InvalidConfig(e.to_string()))?;

        let non_zero = [
            ("trust.token_ttl_ms", self.trust.token_ttl_ms == 0),
            ("trust.nonce_capacity", self.trust.nonce_capacity == 0),
            ("trust.chain_capacity", self.trust.chain_capacity == 0),
            (
                "dispatcher.execution_timeout_ms",
                self.dispatcher.execution_timeout_ms == 0,
            ),
            ("registry.cache_ttl_ms", self.registry.cache_ttl_ms == 0),
            ("ledger.fallback_capacity", self.ledger.fallback_capacity == 0),
            ("ledger.lock_ttl_ms", self.ledger.lock_ttl_ms == 0),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(KernelError::InvalidConfig(format!("{field} must be non-zero")));
        }

        if let StorageConfig::Postgres {
            url, max_connections, ..
        } = &self.storage
        {
            if url.is_empty() {
                return Err(KernelError::InvalidConfig("storage.url is empty".to_string()));
            }
            if *max_connections == 0 {
                return Err(KernelError::InvalidConfig(
                    "storage.max_connections must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create a development configuration
    pub fn development() -> Self {
        Self {
            telemetry: TelemetryConfig {
                log_level: "debug".to_string(),
                json: false,
            },
            ..Default::default()
        }
    }
}

impl TrustConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }
}

impl DispatcherSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl RegistrySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl LedgerSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}
