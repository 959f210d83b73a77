use keel_types::{AccessType, ActionContract, ActionId, Principal, TenantId};

/// Everything the engine needs to decide one call.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub principal: Principal,
    pub action_id: ActionId,
    pub tenant_id: TenantId,
    pub access_type: Option<AccessType>,
    pub data_classification: Option<String>,
}

impl PolicyRequest {
    pub fn new(
        principal: Principal,
        action_id: impl Into<ActionId>,
        tenant_id: impl Into<TenantId>,
    ) -> Self {
        Self {
            principal,
            action_id: action_id.into(),
            tenant_id: tenant_id.into(),
            access_type: None,
            data_classification: None,
        }
    }

    /// Build a request carrying the contract's classification hints.
    pub fn for_contract(principal: Principal, contract: &ActionContract, tenant_id: TenantId) -> Self {
        Self {
            principal,
            action_id: contract.action_id.clone(),
            tenant_id,
            access_type: contract.access_type,
            data_classification: contract.data_classification.clone(),
        }
    }

    pub fn with_access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = Some(access_type);
        self
    }

    pub fn with_data_classification(mut self, classification: impl Into<String>) -> Self {
        self.data_classification = Some(classification.into());
        self
    }
}
