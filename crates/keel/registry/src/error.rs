use keel_guard::GuardError;
use keel_storage::StorageError;
use keel_types::{EngineId, PolicyDecision};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// One unmet dependency of an engine being activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyIssue {
    Missing { dependency: EngineId },
    Inactive { dependency: EngineId, status: String },
}

impl std::fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyIssue::Missing { dependency } => write!(f, "{dependency} is not registered"),
            DependencyIssue::Inactive { dependency, status } => {
                write!(f, "{dependency} is {status}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid manifest: {}", .0.join("; "))]
    InvalidManifest(Vec<String>),

    #[error("manifest signature rejected: {0}")]
    SignatureInvalid(String),

    #[error("engine {engine_id} version {version} is already published with a different manifest")]
    VersionConflict { engine_id: EngineId, version: String },

    #[error("engine not found: {0}")]
    NotFound(String),

    #[error("unmet dependencies for {engine_id}: {}", .issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", "))]
    Dependencies {
        engine_id: EngineId,
        issues: Vec<DependencyIssue>,
    },

    #[error("engine installation denied: {}", .0.reason)]
    Denied(PolicyDecision),

    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] GuardError),
}
