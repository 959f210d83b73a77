use crate::permission::PermissionId;
use serde::{Deserialize, Serialize};

/// Prefix of the deny reason when required permissions are missing.
pub const MISSING_PERMISSIONS_PREFIX: &str = "missing_permissions:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit access hint on a request; overrides the action prefix table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
    Admin,
}

/// The allow/deny verdict for one request.
///
/// Not persisted on its own; audit entries embed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub effect: Effect,
    pub reason: String,
    pub required_permissions: Vec<PermissionId>,
    /// Set when the kernel superuser bypassed evaluation.
    #[serde(default)]
    pub bypass: bool,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>, required_permissions: Vec<PermissionId>) -> Self {
        Self {
            effect: Effect::Allow,
            reason: reason.into(),
            required_permissions,
            bypass: false,
        }
    }

    pub fn deny_missing(required_permissions: Vec<PermissionId>, missing: &[PermissionId]) -> Self {
        let joined = missing
            .iter()
            .map(PermissionId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            effect: Effect::Deny,
            reason: format!("{MISSING_PERMISSIONS_PREFIX}{joined}"),
            required_permissions,
            bypass: false,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}
