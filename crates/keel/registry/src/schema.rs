//! JSON Schema helpers shared by manifest checks and action I/O validation.

use crate::error::{RegistryError, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// A compiled validator.
pub struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self> {
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(schema)
            .map_err(|e| RegistryError::Schema(e.to_string()))?;
        Ok(Self { validator })
    }

    /// Every violation as `"<instance path>: <message>"`; empty when valid.
    pub fn violations(&self, instance: &Value) -> Vec<String> {
        self.validator
            .iter_errors(instance)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect()
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }
}

/// Compiled validators keyed by caller-chosen identity, e.g. action and version.
///
/// Contracts are immutable per version, so entries never go stale.
#[derive(Default)]
pub struct SchemaCache {
    compiled: DashMap<String, Arc<CompiledSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, key: &str, schema: &Value) -> Result<Arc<CompiledSchema>> {
        if let Some(found) = self.compiled.get(key) {
            return Ok(found.clone());
        }
        let compiled = Arc::new(CompiledSchema::compile(schema)?);
        self.compiled.insert(key.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
