use crate::error::{PolicyError, Result};
use crate::permissions::effective_permissions;
use crate::request::PolicyRequest;
use crate::requirements::required_permissions;
use keel_types::{ActionContract, Effect, PermissionId, PolicyDecision, Principal, RoleId, TenantId};

/// Reason recorded when the internal kernel principal skips evaluation.
pub const KERNEL_BYPASS_REASON: &str = "kernel_bypass";

/// Reason recorded when a tenant-bound principal targets another tenant.
pub const TENANT_MISMATCH_REASON: &str = "tenant_mismatch";

/// Stateless RBAC policy engine.
///
/// Holds no mutable state; every decision depends only on the request.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    _private: (),
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, request: &PolicyRequest) -> PolicyDecision {
        let required = required_permissions(&request.action_id, request.access_type);
        let principal = &request.principal;

        if principal.is_kernel() {
            tracing::warn!(
                action_id = %request.action_id,
                tenant_id = %request.tenant_id,
                "kernel principal bypassed policy evaluation"
            );
            return PolicyDecision {
                effect: Effect::Allow,
                reason: KERNEL_BYPASS_REASON.to_string(),
                required_permissions: required,
                bypass: true,
            };
        }

        if crosses_tenant(principal, &request.tenant_id) {
            tracing::info!(
                principal_id = %principal.id,
                action_id = %request.action_id,
                tenant_id = %request.tenant_id,
                "tenant-bound principal denied outside its tenant"
            );
            return PolicyDecision {
                effect: Effect::Deny,
                reason: TENANT_MISMATCH_REASON.to_string(),
                required_permissions: required,
                bypass: false,
            };
        }

        let granted = effective_permissions(principal);
        let missing: Vec<PermissionId> = required
            .iter()
            .copied()
            .filter(|permission| !granted.contains(permission))
            .collect();

        let decision = if missing.is_empty() {
            PolicyDecision::allow("rbac_allow", required)
        } else {
            PolicyDecision::deny_missing(required, &missing)
        };

        tracing::debug!(
            principal_id = %principal.id,
            action_id = %request.action_id,
            tenant_id = %request.tenant_id,
            classification = request.data_classification.as_deref().unwrap_or("none"),
            effect = %decision.effect,
            reason = %decision.reason,
            "policy evaluated"
        );
        decision
    }

    /// Evaluate using the contract's access and classification hints.
    pub fn evaluate_contract(
        &self,
        principal: &Principal,
        contract: &ActionContract,
        tenant_id: &TenantId,
    ) -> PolicyDecision {
        self.evaluate(&PolicyRequest::for_contract(
            principal.clone(),
            contract,
            tenant_id.clone(),
        ))
    }

    /// Evaluate and turn a deny into an error, for call sites that fail closed.
    pub fn enforce(&self, request: &PolicyRequest) -> Result<PolicyDecision> {
        let decision = self.evaluate(request);
        if decision.is_allowed() {
            Ok(decision)
        } else {
            Err(PolicyError::Denied(decision))
        }
    }
}

// Platform roles operate across tenants; everyone else stays in their own.
fn crosses_tenant(principal: &Principal, tenant_id: &TenantId) -> bool {
    let Some(ref home) = principal.tenant_id else {
        return false;
    };
    if home == tenant_id {
        return false;
    }
    !principal
        .roles
        .iter()
        .any(|role| matches!(role, RoleId::PlatformAdmin | RoleId::PlatformAuditor))
}
