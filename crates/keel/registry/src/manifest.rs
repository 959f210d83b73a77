use crate::error::{RegistryError, Result};
use keel_types::{
    AccessType, ActionContract, ActionId, EngineId, ExecutionMode, RiskBand, SideEffectLevel,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Built-in JSON Schema every submitted manifest must satisfy.
pub fn manifest_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["engine_id", "name", "version", "actions"],
        "properties": {
            "engine_id": {"type": "string", "pattern": "^[a-z][a-z0-9_.-]{0,63}$"},
            "name": {"type": "string", "minLength": 1},
            "version": {
                "type": "string",
                "pattern": "^(0|[1-9][0-9]*)\\.(0|[1-9][0-9]*)\\.(0|[1-9][0-9]*)(-[0-9A-Za-z.-]+)?(\\+[0-9A-Za-z.-]+)?$"
            },
            "description": {"type": "string"},
            "dependencies": {
                "type": "array",
                "items": {"type": "string", "minLength": 1},
                "uniqueItems": true
            },
            "actions": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["action_id", "name", "input_schema", "output_schema"],
                    "properties": {
                        "action_id": {"type": "string", "pattern": "^[a-z][a-z0-9_]*(\\.[a-z][a-z0-9_]*)+$"},
                        "name": {"type": "string", "minLength": 1},
                        "version": {"type": "string"},
                        "mode": {"enum": ["sync", "async"]},
                        "input_schema": {"type": "object"},
                        "output_schema": {"type": "object"},
                        "risk_band": {"enum": ["low", "medium", "high", "critical"]},
                        "side_effect_level": {"enum": ["none", "read", "write", "external"]},
                        "idempotency_keyed": {"type": "boolean"},
                        "deprecated": {"type": "boolean"},
                        "access_type": {"enum": ["read", "write", "admin"]},
                        "data_classification": {"type": "string"},
                        "timeout_ms": {"type": "integer", "minimum": 1}
                    }
                }
            }
        }
    })
}

/// Typed view of a manifest that passed the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineManifest {
    pub engine_id: EngineId,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<EngineId>,
    pub actions: Vec<ActionDefinition>,
}

/// One action as declared inside a manifest. The engine id is implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub action_id: ActionId,
    pub name: String,
    /// Defaults to the manifest version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl EngineManifest {
    /// Deserialize and apply the checks JSON Schema cannot express.
    pub fn from_value(manifest: &Value) -> Result<Self> {
        let parsed: EngineManifest = serde_json::from_value(manifest.clone())
            .map_err(|e| RegistryError::InvalidManifest(vec![e.to_string()]))?;

        let mut problems = Vec::new();
        if let Err(err) = semver::Version::parse(&parsed.version) {
            problems.push(format!("/version: {err}"));
        }
        let mut seen = BTreeSet::new();
        for action in &parsed.actions {
            if !seen.insert(action.action_id.as_str()) {
                problems.push(format!("/actions: duplicate action id {}", action.action_id));
            }
        }
        if parsed.dependencies.contains(&parsed.engine_id) {
            problems.push("/dependencies: engine depends on itself".to_string());
        }

        if problems.is_empty() {
            Ok(parsed)
        } else {
            Err(RegistryError::InvalidManifest(problems))
        }
    }

    pub fn action(&self, action_id: &ActionId) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| &a.action_id == action_id)
    }

    /// The full contract for one of this engine's actions.
    pub fn contract(&self, action_id: &ActionId) -> Option<ActionContract> {
        let action = self.action(action_id)?;
        Some(ActionContract {
            action_id: action.action_id.clone(),
            engine_id: self.engine_id.clone(),
            name: action.name.clone(),
            version: action.version.clone().unwrap_or_else(|| self.version.clone()),
            mode: action.mode,
            input_schema: action.input_schema.clone(),
            output_schema: action.output_schema.clone(),
            risk_band: action.risk_band,
            side_effect_level: action.side_effect_level,
            idempotency_keyed: action.idempotency_keyed,
            deprecated: action.deprecated,
            access_type: action.access_type,
            data_classification: action.data_classification.clone(),
            timeout_ms: action.timeout_ms,
        })
    }
}
