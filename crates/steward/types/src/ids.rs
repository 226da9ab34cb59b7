//! Identifier newtypes

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Create an identifier from a known string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Short display form (first 8 chars)
            pub fn short(&self) -> String {
                self.0.chars().take(8).collect()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// A tenant: an isolated organization
    OrganizationId
);

string_id!(
    /// A sub-scope (homeowners association, building) inside an organization
    AssociationId
);

string_id!(
    /// A user or service principal performing an operation
    ActorId
);

string_id!(
    /// A review request: the workflow entity driven by the dispatcher
    RequestId
);

string_id!(
    /// A reviewing committee
    CommitteeId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = OrganizationId::new("org-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"org-1\"");
        assert_eq!(id.to_string(), "org-1");
    }

    #[test]
    fn test_short() {
        let id = ActorId::new("abcdefghijkl");
        assert_eq!(id.short(), "abcdefgh");
    }
}
