use keel_types::{PermissionId, Principal};
use std::collections::BTreeSet;

/// Scopes of the form `perm:<id>`, `perm:<domain>.*` or `perm:*` grant permissions.
pub const SCOPE_PREFIX: &str = "perm:";

/// Union of the principal's role permissions and permission-granting scopes.
///
/// Scopes without the `perm:` prefix are not permission grants and are left
/// alone; `perm:` scopes naming no known permission or domain are ignored.
pub fn effective_permissions(principal: &Principal) -> BTreeSet<PermissionId> {
    let mut granted: BTreeSet<PermissionId> = principal
        .roles
        .iter()
        .flat_map(|role| role.permissions().iter().copied())
        .collect();

    for scope in &principal.scopes {
        let Some(grant) = scope.strip_prefix(SCOPE_PREFIX) else {
            continue;
        };

        if grant == "*" {
            granted.extend(PermissionId::ALL);
            continue;
        }

        if let Some(domain) = grant.strip_suffix(".*") {
            let domain_permissions: Vec<PermissionId> = PermissionId::in_domain(domain).collect();
            if domain_permissions.is_empty() {
                tracing::debug!(scope = %scope, "ignoring scope for unknown permission domain");
            }
            granted.extend(domain_permissions);
            continue;
        }

        match grant.parse::<PermissionId>() {
            Ok(permission) => {
                granted.insert(permission);
            }
            Err(_) => {
                tracing::debug!(scope = %scope, "ignoring scope for unknown permission");
            }
        }
    }

    granted
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{AuthMethod, RoleId};

    fn principal() -> Principal {
        Principal::new("u-1", AuthMethod::ApiKey).in_tenant("t-1")
    }

    #[test]
    fn roles_expand_to_catalog_permissions() {
        let granted = effective_permissions(&principal().with_role(RoleId::TenantViewer));
        assert_eq!(
            granted,
            BTreeSet::from([
                PermissionId::EngineReadMetadata,
                PermissionId::DataReadFinancial
            ])
        );
    }

    #[test]
    fn wildcard_scope_grants_everything() {
        let granted = effective_permissions(&principal().with_scope("perm:*"));
        assert_eq!(granted.len(), PermissionId::ALL.len());
    }

    #[test]
    fn domain_scope_grants_the_domain_only() {
        let granted = effective_permissions(&principal().with_scope("perm:audit.*"));
        assert_eq!(
            granted,
            BTreeSet::from([PermissionId::AuditRead, PermissionId::AuditVerify])
        );
    }

    #[test]
    fn data_domain_scope_grants_financial_access_only() {
        let granted = effective_permissions(&principal().with_scope("perm:data.*"));
        assert!(granted.contains(&PermissionId::DataReadFinancial));
        assert!(granted.contains(&PermissionId::DataWriteFinancial));
        assert!(!granted.contains(&PermissionId::EngineInstall));
        assert_eq!(granted.len(), 2);
    }

    #[test]
    fn unknown_and_foreign_scopes_are_ignored() {
        let granted = effective_permissions(
            &principal()
                .with_scope("perm:nope.nothing")
                .with_scope("perm:bogus.*")
                .with_scope("reports:export")
                .with_scope("perm:engine.install"),
        );
        assert_eq!(granted, BTreeSet::from([PermissionId::EngineInstall]));
    }
}
