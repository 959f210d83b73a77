use keel_types::{AccessType, ActionId, PermissionId};

/// Verb prefixes treated as reads for the `accounting.` and `reports.` domains.
pub const READ_VERB_PREFIXES: [&str; 4] = ["get_", "list_", "read_", "export_"];

#[derive(Clone, Copy)]
enum Rule {
    Exact(&'static str, PermissionId),
    /// Prefix with a permission for read verbs and one for everything else.
    Prefix {
        prefix: &'static str,
        read_verbs: &'static [&'static str],
        read: PermissionId,
        other: PermissionId,
    },
}

// First match wins; order matters.
const PREFIX_TABLE: &[Rule] = &[
    Rule::Exact("engine.install", PermissionId::EngineInstall),
    Rule::Prefix {
        prefix: "engine.",
        read_verbs: &["get_", "list_"],
        read: PermissionId::EngineReadMetadata,
        other: PermissionId::EngineManage,
    },
    Rule::Exact("audit.verify", PermissionId::AuditVerify),
    Rule::Prefix {
        prefix: "audit.",
        read_verbs: &[],
        read: PermissionId::AuditRead,
        other: PermissionId::AuditRead,
    },
    Rule::Prefix {
        prefix: "accounting.",
        read_verbs: &READ_VERB_PREFIXES,
        read: PermissionId::DataReadFinancial,
        other: PermissionId::DataWriteFinancial,
    },
    Rule::Prefix {
        prefix: "reports.",
        read_verbs: &READ_VERB_PREFIXES,
        read: PermissionId::DataReadFinancial,
        other: PermissionId::DataReadFinancial,
    },
];

/// Permissions an action requires.
///
/// An explicit access hint wins over the prefix table; actions matching no
/// entry require `action.execute`.
pub fn required_permissions(
    action_id: &ActionId,
    access_type: Option<AccessType>,
) -> Vec<PermissionId> {
    if let Some(access) = access_type {
        return vec![match access {
            AccessType::Read => PermissionId::DataReadFinancial,
            AccessType::Write => PermissionId::DataWriteFinancial,
            AccessType::Admin => PermissionId::TenantAdmin,
        }];
    }

    let action = action_id.as_str();
    for rule in PREFIX_TABLE {
        match *rule {
            Rule::Exact(id, permission) if action == id => return vec![permission],
            Rule::Prefix {
                prefix,
                read_verbs,
                read,
                other,
            } if action.starts_with(prefix) => {
                let verb = &action[prefix.len()..];
                let is_read = read_verbs.iter().any(|v| verb.starts_with(v));
                return vec![if is_read { read } else { other }];
            }
            _ => {}
        }
    }

    vec![PermissionId::ActionExecute]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(action: &str) -> Vec<PermissionId> {
        required_permissions(&ActionId::new(action), None)
    }

    #[test]
    fn prefix_table() {
        assert_eq!(required("engine.install"), vec![PermissionId::EngineInstall]);
        assert_eq!(
            required("engine.list_installed"),
            vec![PermissionId::EngineReadMetadata]
        );
        assert_eq!(required("engine.disable"), vec![PermissionId::EngineManage]);
        assert_eq!(required("audit.verify"), vec![PermissionId::AuditVerify]);
        assert_eq!(required("audit.query"), vec![PermissionId::AuditRead]);
        assert_eq!(
            required("accounting.create_journal_entry"),
            vec![PermissionId::DataWriteFinancial]
        );
        assert_eq!(
            required("accounting.list_accounts"),
            vec![PermissionId::DataReadFinancial]
        );
        assert_eq!(
            required("reports.export_ledger"),
            vec![PermissionId::DataReadFinancial]
        );
        assert_eq!(required("crm.sync_contacts"), vec![PermissionId::ActionExecute]);
    }

    #[test]
    fn access_hint_overrides_prefix() {
        assert_eq!(
            required_permissions(
                &ActionId::new("accounting.list_accounts"),
                Some(AccessType::Admin)
            ),
            vec![PermissionId::TenantAdmin]
        );
        assert_eq!(
            required_permissions(&ActionId::new("crm.sync"), Some(AccessType::Write)),
            vec![PermissionId::DataWriteFinancial]
        );
    }
}
