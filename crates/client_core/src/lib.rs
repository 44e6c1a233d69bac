pub mod auth;
pub mod memory;
pub mod provider;
pub mod todos;

pub use auth::{AuthController, AuthState, RegisterPolicy};
pub use memory::MemoryBackend;
pub use provider::{IdentityProvider, SnapshotStream, UserScopedStore};
pub use todos::{TodoListController, TodoListState};
