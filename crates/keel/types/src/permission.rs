use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Closed set of permissions known at build time.
///
/// Referencing a permission that does not exist is a compile error, not a
/// runtime branch: catalogs are built from these variants only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionId {
    #[serde(rename = "engine.read_metadata")]
    EngineReadMetadata,
    #[serde(rename = "engine.install")]
    EngineInstall,
    #[serde(rename = "engine.manage")]
    EngineManage,
    #[serde(rename = "data.read_financial")]
    DataReadFinancial,
    #[serde(rename = "data.write_financial")]
    DataWriteFinancial,
    #[serde(rename = "action.execute")]
    ActionExecute,
    #[serde(rename = "audit.read")]
    AuditRead,
    #[serde(rename = "audit.verify")]
    AuditVerify,
    #[serde(rename = "tenant.admin")]
    TenantAdmin,
}

impl PermissionId {
    pub const ALL: [PermissionId; 9] = [
        PermissionId::EngineReadMetadata,
        PermissionId::EngineInstall,
        PermissionId::EngineManage,
        PermissionId::DataReadFinancial,
        PermissionId::DataWriteFinancial,
        PermissionId::ActionExecute,
        PermissionId::AuditRead,
        PermissionId::AuditVerify,
        PermissionId::TenantAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionId::EngineReadMetadata => "engine.read_metadata",
            PermissionId::EngineInstall => "engine.install",
            PermissionId::EngineManage => "engine.manage",
            PermissionId::DataReadFinancial => "data.read_financial",
            PermissionId::DataWriteFinancial => "data.write_financial",
            PermissionId::ActionExecute => "action.execute",
            PermissionId::AuditRead => "audit.read",
            PermissionId::AuditVerify => "audit.verify",
            PermissionId::TenantAdmin => "tenant.admin",
        }
    }

    /// Domain of the permission: the text before the first `.`.
    pub fn domain(&self) -> &'static str {
        let id = self.as_str();
        id.split_once('.').map(|(domain, _)| domain).unwrap_or(id)
    }

    /// Full catalog entry for this permission.
    pub fn describe(&self) -> Permission {
        let (description, tags): (&str, &[&str]) = match self {
            PermissionId::EngineReadMetadata => ("Read engine and action metadata", &["read"]),
            PermissionId::EngineInstall => ("Install or upgrade an engine", &["write", "admin"]),
            PermissionId::EngineManage => ("Enable, disable and deprecate engines", &["admin"]),
            PermissionId::DataReadFinancial => ("Read financial records", &["read", "financial"]),
            PermissionId::DataWriteFinancial => {
                ("Create or modify financial records", &["write", "financial"])
            }
            PermissionId::ActionExecute => ("Execute generic actions", &["execute"]),
            PermissionId::AuditRead => ("Query the audit ledger", &["read", "compliance"]),
            PermissionId::AuditVerify => ("Verify audit chain integrity", &["compliance"]),
            PermissionId::TenantAdmin => ("Administer a tenant", &["admin"]),
        };
        Permission {
            id: *self,
            domain: self.domain().to_string(),
            description: description.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// All permissions that belong to `domain`.
    pub fn in_domain(domain: &str) -> impl Iterator<Item = PermissionId> + '_ {
        Self::ALL.into_iter().filter(move |p| p.domain() == domain)
    }
}

impl std::fmt::Display for PermissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown permission: {0}")]
pub struct UnknownPermission(pub String);

impl FromStr for PermissionId {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

/// Catalog entry describing a permission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub domain: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_round_trips_through_from_str() {
        for permission in PermissionId::ALL {
            assert_eq!(permission.as_str().parse::<PermissionId>(), Ok(permission));
        }
        assert!("data.delete_everything".parse::<PermissionId>().is_err());
    }

    #[test]
    fn serde_uses_dotted_ids() {
        let json = serde_json::to_string(&PermissionId::DataWriteFinancial).unwrap();
        assert_eq!(json, "\"data.write_financial\"");
    }

    #[test]
    fn domain_lookup() {
        let data: Vec<_> = PermissionId::in_domain("data").collect();
        assert_eq!(
            data,
            vec![PermissionId::DataReadFinancial, PermissionId::DataWriteFinancial]
        );
        assert_eq!(PermissionId::EngineInstall.describe().domain, "engine");
    }
}
