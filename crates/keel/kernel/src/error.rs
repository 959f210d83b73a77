use keel_types::PolicyDecision;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),

    #[error("guard error: {0}")]
    Guard(#[from] keel_guard::GuardError),

    #[error("registry error: {0}")]
    Registry(#[from] keel_registry::RegistryError),

    #[error("ledger error: {0}")]
    Ledger(#[from] keel_ledger::LedgerError),

    #[error("trust error: {0}")]
    Trust(#[from] keel_trust::TrustError),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {}", .0.reason)]
    Forbidden(PolicyDecision),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("kernel is shut down")]
    ShutDown,
}
