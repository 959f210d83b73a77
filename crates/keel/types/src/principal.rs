use crate::ids::TenantId;
use crate::role::RoleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Id of the distinguished internal superuser.
pub const KERNEL_PRINCIPAL_ID: &str = "kernel";

/// How the principal authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Session,
    Service,
    Internal,
    Anonymous,
}

/// The authenticated identity making a call. Immutable for the lifetime of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant_id: Option<TenantId>,
    pub roles: BTreeSet<RoleId>,
    pub scopes: BTreeSet<String>,
    pub auth_method: AuthMethod,
}

impl Principal {
    pub fn new(id: impl Into<String>, auth_method: AuthMethod) -> Self {
        Self {
            id: id.into(),
            tenant_id: None,
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
            auth_method,
        }
    }

    /// The internal kernel principal. Always allowed by policy, always audited.
    pub fn kernel() -> Self {
        Self::new(KERNEL_PRINCIPAL_ID, AuthMethod::Internal)
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", AuthMethod::Anonymous)
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_role(mut self, role: RoleId) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.insert(scope.into());
        self
    }

    pub fn is_kernel(&self) -> bool {
        self.auth_method == AuthMethod::Internal && self.id == KERNEL_PRINCIPAL_ID
    }

    pub fn is_anonymous(&self) -> bool {
        self.auth_method == AuthMethod::Anonymous
    }
}
