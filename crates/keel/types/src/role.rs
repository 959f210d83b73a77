use crate::permission::PermissionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Closed set of roles known at build time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoleId {
    #[serde(rename = "tenant.viewer")]
    TenantViewer,
    #[serde(rename = "tenant.accountant")]
    TenantAccountant,
    #[serde(rename = "tenant.admin")]
    TenantAdmin,
    #[serde(rename = "platform.auditor")]
    PlatformAuditor,
    #[serde(rename = "platform.admin")]
    PlatformAdmin,
}

impl RoleId {
    pub const ALL: [RoleId; 5] = [
        RoleId::TenantViewer,
        RoleId::TenantAccountant,
        RoleId::TenantAdmin,
        RoleId::PlatformAuditor,
        RoleId::PlatformAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleId::TenantViewer => "tenant.viewer",
            RoleId::TenantAccountant => "tenant.accountant",
            RoleId::TenantAdmin => "tenant.admin",
            RoleId::PlatformAuditor => "platform.auditor",
            RoleId::PlatformAdmin => "platform.admin",
        }
    }

    /// Permissions granted by this role.
    pub fn permissions(&self) -> &'static [PermissionId] {
        use PermissionId::*;
        match self {
            RoleId::TenantViewer => &[EngineReadMetadata, DataReadFinancial],
            RoleId::TenantAccountant => &[
                EngineReadMetadata,
                DataReadFinancial,
                DataWriteFinancial,
                ActionExecute,
            ],
            RoleId::TenantAdmin => &[
                EngineReadMetadata,
                DataReadFinancial,
                DataWriteFinancial,
                ActionExecute,
                EngineInstall,
                EngineManage,
                AuditRead,
                TenantAdmin,
            ],
            RoleId::PlatformAuditor => &[AuditRead, AuditVerify, EngineReadMetadata],
            RoleId::PlatformAdmin => &PermissionId::ALL,
        }
    }

    pub fn describe(&self) -> Role {
        let description = match self {
            RoleId::TenantViewer => "Read-only access to tenant data and metadata",
            RoleId::TenantAccountant => "Book and read financial records",
            RoleId::TenantAdmin => "Full control over one tenant",
            RoleId::PlatformAuditor => "Cross-tenant audit access",
            RoleId::PlatformAdmin => "Every permission in the catalog",
        };
        Role {
            id: *self,
            description: description.to_string(),
            permissions: self.permissions().iter().copied().collect(),
        }
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for RoleId {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Catalog entry describing a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub description: String,
    pub permissions: BTreeSet<PermissionId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_matches_catalog() {
        let viewer = RoleId::TenantViewer.describe();
        assert_eq!(
            viewer.permissions,
            [
                PermissionId::EngineReadMetadata,
                PermissionId::DataReadFinancial
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn accountant_can_write_financial_data() {
        assert!(RoleId::TenantAccountant
            .permissions()
            .contains(&PermissionId::DataWriteFinancial));
    }

    #[test]
    fn platform_admin_holds_everything() {
        assert_eq!(
            RoleId::PlatformAdmin.permissions().len(),
            PermissionId::ALL.len()
        );
    }
}
