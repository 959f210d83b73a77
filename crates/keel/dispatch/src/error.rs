use crate::state::DispatchState;
use keel_guard::RateLimitLayer;
use keel_types::{ActionId, EngineId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Why an invocation stopped. Every variant is terminal for that invocation
/// and none of them is fatal to the process.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("no contract for {engine_id}/{action_id}")]
    ContractNotFound { engine_id: EngineId, action_id: ActionId },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("{layer} rate limit exceeded; retry in {reset_ms}ms")]
    QuotaExceeded { layer: RateLimitLayer, reset_ms: u64 },

    #[error("circuit open for engine {0}")]
    CircuitOpen(EngineId),

    #[error("trust verification failed: {}", .0.join("; "))]
    TrustVerificationFailed(Vec<String>),

    #[error("input does not match contract: {}", .0.join("; "))]
    InputValidationFailed(Vec<String>),

    #[error("no handler registered for {0}")]
    HandlerNotFound(ActionId),

    #[error("handler failed: {0}")]
    HandlerExecutionFailed(String),

    #[error("output does not match contract: {}", .0.join("; "))]
    OutputValidationFailed(Vec<String>),

    #[error("cancelled before execution (at {0})")]
    Cancelled(DispatchState),

    /// A collaborator needed to reach a decision was unavailable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::ContractNotFound { .. } => "contract_not_found",
            DispatchError::PolicyDenied(_) => "policy_denied",
            DispatchError::QuotaExceeded { .. } => "quota_exceeded",
            DispatchError::CircuitOpen(_) => "circuit_open",
            DispatchError::TrustVerificationFailed(_) => "trust_verification_failed",
            DispatchError::InputValidationFailed(_) => "input_validation_failed",
            DispatchError::HandlerNotFound(_) => "handler_not_found",
            DispatchError::HandlerExecutionFailed(_) => "handler_execution_failed",
            DispatchError::OutputValidationFailed(_) => "output_validation_failed",
            DispatchError::Cancelled(_) => "cancelled",
            DispatchError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::ContractNotFound { .. } => 404,
            DispatchError::PolicyDenied(_) => 403,
            DispatchError::QuotaExceeded { .. } => 429,
            DispatchError::CircuitOpen(_) => 503,
            DispatchError::TrustVerificationFailed(_) => 401,
            DispatchError::InputValidationFailed(_) => 422,
            DispatchError::OutputValidationFailed(_) => 500,
            DispatchError::HandlerExecutionFailed(_) => 500,
            DispatchError::HandlerNotFound(_) => 501,
            DispatchError::Cancelled(_) => 499,
            DispatchError::Internal(_) => 500,
        }
    }

    /// Refusals by the kernel, as opposed to failures while serving the call.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            DispatchError::PolicyDenied(_)
                | DispatchError::QuotaExceeded { .. }
                | DispatchError::CircuitOpen(_)
                | DispatchError::TrustVerificationFailed(_)
        )
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            DispatchError::QuotaExceeded { layer, reset_ms } => {
                Some(json!({"layer": layer, "reset_ms": reset_ms}))
            }
            DispatchError::TrustVerificationFailed(errors)
            | DispatchError::InputValidationFailed(errors)
            | DispatchError::OutputValidationFailed(errors) => Some(json!({"errors": errors})),
            DispatchError::Cancelled(stage) => Some(json!({"stage": stage})),
            _ => None,
        }
    }

    pub fn body(&self, action_id: &ActionId) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            action_id: action_id.clone(),
            details: self.details(),
        }
    }
}

/// Structured error handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub action_id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
