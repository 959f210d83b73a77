use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of one invocation, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Received,
    ContractLoaded,
    PolicyEvaluated,
    QuotaChecked,
    /// Only reached when the call carried trust evidence or trust is required.
    TrustVerified,
    InputValidated,
    Executing,
    OutputValidated,
    Audited,
    Completed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Received => "received",
            DispatchState::ContractLoaded => "contract_loaded",
            DispatchState::PolicyEvaluated => "policy_evaluated",
            DispatchState::QuotaChecked => "quota_checked",
            DispatchState::TrustVerified => "trust_verified",
            DispatchState::InputValidated => "input_validated",
            DispatchState::Executing => "executing",
            DispatchState::OutputValidated => "output_validated",
            DispatchState::Audited => "audited",
            DispatchState::Completed => "completed",
        }
    }

    /// Whether the handler may already have produced side effects.
    pub fn has_executed(&self) -> bool {
        *self >= DispatchState::Executing
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
