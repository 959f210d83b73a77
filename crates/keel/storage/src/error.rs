use keel_types::TenantId;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// The append named a `prev_hash` that is no longer the tenant's tail.
    #[error("stale audit tail for tenant {tenant_id}: expected {expected}, found {found}")]
    StaleTail {
        tenant_id: TenantId,
        expected: String,
        found: String,
    },

    /// A uniqueness rule rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
