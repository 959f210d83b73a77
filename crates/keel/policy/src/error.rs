use keel_types::PolicyDecision;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    /// The request was evaluated and denied.
    #[error("policy denied: {}", .0.reason)]
    Denied(PolicyDecision),
}

impl PolicyError {
    pub fn decision(&self) -> &PolicyDecision {
        match self {
            PolicyError::Denied(decision) => decision,
        }
    }
}
