use keel_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("lock {0} not acquired before the wait deadline")]
    LockTimeout(String),

    #[error("invalid guard configuration: {0}")]
    InvalidConfig(String),

    #[error("guard store error: {0}")]
    Store(#[from] StorageError),
}
