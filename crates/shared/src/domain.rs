use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(TodoId);

/// The signed-in principal as reported by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub email: Option<String>,
}

/// One to-do record, serialized exactly as the store keeps it. Every field
/// is defaultable so records written by older client versions still parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub id: TodoId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

impl TodoItem {
    /// A new, not-yet-stored item: empty id, not completed.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: TodoId::default(),
            title: title.into(),
            completed: false,
        }
    }
}

/// One full push from the per-user store: every record currently under the
/// user's scope, keyed by id, entry values still undecoded. Entries arrive
/// in the store's key order.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub entries: Vec<(TodoId, serde_json::Value)>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
