//! Distinct identifier types for cells, kernel launches and documents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// A fresh random (UUID v4) id.
            pub fn new() -> Self {
                $name(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }
    };
}

string_id!(
    /// Identifies a cell within one notebook. Ids read from disk keep their value.
    CellId
);

string_id!(
    /// Identifies one kernel launch. A restart mints a new ref, so messages
    /// and actions from the old kernel can be told apart.
    KernelRef
);

string_id!(
    /// Identifies an open document.
    ContentRef
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_uuids() {
        let id = CellId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(CellId::new(), CellId::new());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = KernelRef::from("kernel-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"kernel-a\"");
        let parsed: KernelRef = serde_json::from_str("\"kernel-a\"").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_display() {
        assert_eq!(ContentRef::from("doc").to_string(), "doc");
    }
}
