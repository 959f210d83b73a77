use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Tenant identifier. Every governed call executes inside exactly one tenant.
    TenantId
);
string_id!(
    /// Identifier of an installable engine (a bundle of actions).
    EngineId
);
string_id!(
    /// Fully qualified action identifier, e.g. `accounting.create_journal_entry`.
    ActionId
);

impl ActionId {
    /// Verb part of the action id (text after the last `.`).
    pub fn verb(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_verb_is_last_segment() {
        assert_eq!(
            ActionId::new("accounting.create_journal_entry").verb(),
            "create_journal_entry"
        );
        assert_eq!(ActionId::new("ping").verb(), "ping");
    }
}
