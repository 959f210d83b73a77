use crate::verifier::VerificationReport;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrustError>;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("signing authority has been shut down")]
    AuthorityShutdown,

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("parent identity chain not found: {0}")]
    ParentChainNotFound(String),

    #[error("trust verification failed: {}", .0.errors().join("; "))]
    VerificationFailed(Box<VerificationReport>),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TrustError {
    fn from(err: serde_json::Error) -> Self {
        TrustError::Serialization(err.to_string())
    }
}
