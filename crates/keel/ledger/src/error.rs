use keel_guard::GuardError;
use keel_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("audit store error: {0}")]
    Storage(#[from] StorageError),

    #[error("audit lock error: {0}")]
    Lock(#[from] GuardError),

    #[error("chain tail for tenant {0} kept moving; append abandoned")]
    Contended(String),
}
