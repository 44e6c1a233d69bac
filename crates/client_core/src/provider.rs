use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{Identity, StoreSnapshot, TodoId, TodoItem, UserId},
    error::{ProviderError, StoreError},
};

/// Push subscription to one user's records: each item is a full snapshot of
/// everything under that user's scope, or the error that ended the stream.
pub type SnapshotStream = BoxStream<'static, Result<StoreSnapshot, StoreError>>;

/// The external identity backend. Session state lives on the provider side;
/// the controllers only observe it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Currently signed-in identity, if the backend holds a live session.
    fn current_session(&self) -> Option<Identity>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ProviderError>;

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, ProviderError>;

    /// Invalidates the session. Best-effort: callers treat a failure as
    /// advisory and drop their local notion of the session regardless.
    fn sign_out(&self) -> Result<(), ProviderError>;

    /// Exchanges an externally obtained id token (Google sign-in) for a
    /// session with this backend.
    async fn exchange_external_token(&self, id_token: &str) -> Result<Identity, ProviderError>;
}

/// The external per-user keyed record store. Writes carry no acknowledgement
/// path back to the caller; the subscription push is the source of truth.
#[async_trait]
pub trait UserScopedStore: Send + Sync {
    /// Opens the push subscription for `user`. The first delivery is the
    /// current snapshot; the stream then stays open until dropped or failed.
    async fn subscribe(&self, user: &UserId) -> Result<SnapshotStream, StoreError>;

    /// Allocates a fresh record id under `user`'s scope. Local, no I/O.
    fn allocate_id(&self, user: &UserId) -> TodoId;

    /// Full overwrite of the record at `item.id` under `user`'s scope.
    async fn put(&self, user: &UserId, item: &TodoItem) -> Result<(), StoreError>;

    async fn delete(&self, user: &UserId, id: &TodoId) -> Result<(), StoreError>;
}
