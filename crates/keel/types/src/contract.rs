use crate::decision::AccessType;
use crate::ids::{ActionId, EngineId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectLevel {
    #[default]
    None,
    Read,
    Write,
    External,
}

/// Versioned input/output schema and risk metadata for one action.
///
/// Contracts are immutable once published; a new version is a new record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionContract {
    pub action_id: ActionId,
    pub engine_id: EngineId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub input_schema: Value,
    pub output_schema: Value,
    #[serde(default)]
    pub risk_band: RiskBand,
    #[serde(default)]
    pub side_effect_level: SideEffectLevel,
    #[serde(default)]
    pub idempotency_keyed: bool,
    #[serde(default)]
    pub deprecated: bool,
    /// Classification hint handed to the policy engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
    /// Per-action override of the dispatcher execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}
