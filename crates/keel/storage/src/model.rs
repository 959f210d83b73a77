use chrono::{DateTime, Utc};
use keel_types::{ActionId, EngineId, Effect, RoleId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Sentinel `prev_hash` of the first record in a tenant's chain.
pub const GENESIS_HASH: &str = "GENESIS";

/// Audit append payload. Hashes are computed by the ledger; the sequence is
/// assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub id: String,
    pub tenant_id: TenantId,
    pub actor_id: String,
    pub action_id: ActionId,
    #[serde(default)]
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent tamper-evident audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    /// Position in the tenant's chain, starting at 1.
    pub sequence: u64,
    pub tenant_id: TenantId,
    pub actor_id: String,
    pub action_id: ActionId,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Outcome effect recorded in the payload (`allow`, `deny` or `error`).
    pub fn effect(&self) -> Option<&str> {
        self.payload.get("effect").and_then(Value::as_str)
    }
}

/// Filter for audit reads. `limit = 0` means unbounded.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tenant_id: Option<TenantId>,
    pub action_id: Option<ActionId>,
    pub principal_id: Option<String>,
    /// `allow`, `deny` or `error`.
    pub effect: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl AuditQuery {
    pub fn for_tenant(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect.as_str().to_string());
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref tenant) = self.tenant_id {
            if &record.tenant_id != tenant {
                return false;
            }
        }
        if let Some(ref action) = self.action_id {
            if &record.action_id != action {
                return false;
            }
        }
        if let Some(ref principal) = self.principal_id {
            if &record.actor_id != principal {
                return false;
            }
        }
        if let Some(ref effect) = self.effect {
            if record.effect() != Some(effect.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Installed,
    Enabled,
    Disabled,
    Deprecated,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Installed => "installed",
            EngineStatus::Enabled => "enabled",
            EngineStatus::Disabled => "disabled",
            EngineStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "installed" => Some(EngineStatus::Installed),
            "enabled" => Some(EngineStatus::Enabled),
            "disabled" => Some(EngineStatus::Disabled),
            "deprecated" => Some(EngineStatus::Deprecated),
            _ => None,
        }
    }

    /// Installed and enabled engines count as active for dependency checks.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineStatus::Installed | EngineStatus::Enabled)
    }
}

/// Persistent engine record. One row per `(tenant, engine_id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRecord {
    /// `None` for platform-wide engines visible to every tenant.
    pub tenant_id: Option<TenantId>,
    pub engine_id: EngineId,
    pub name: String,
    pub version: String,
    pub manifest: Value,
    /// Canonical SHA-256 fingerprint of `manifest`.
    pub fingerprint: String,
    pub signature: Option<String>,
    pub status: EngineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// API credential row. Only the hash of the secret is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCredential {
    pub secret_hash: String,
    pub tenant_id: Option<TenantId>,
    pub subject_id: String,
    pub scopes: Vec<String>,
    pub roles: Vec<RoleId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiCredential {
    pub fn is_usable_at(&self, at: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |exp| exp > at)
    }
}

/// Result of an atomic windowed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Time until the window, and therefore the counter, expires.
    pub reset_after: Duration,
}
