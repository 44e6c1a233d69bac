use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use shared::{
    domain::{Identity, StoreSnapshot, TodoId, TodoItem, UserId},
    error::{ProviderError, StoreError},
};

use crate::provider::{IdentityProvider, SnapshotStream, UserScopedStore};

const SNAPSHOT_FEED_CAPACITY: usize = 16;

/// In-process backend implementing both capability contracts: accounts, a
/// single session slot, and per-user record maps that push a fresh snapshot
/// on every mutation. Backs tests and the demo mode, not durable storage.
pub struct MemoryBackend {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, MemoryAccount>,
    session: Option<Identity>,
    records: HashMap<UserId, BTreeMap<String, serde_json::Value>>,
    feeds: HashMap<UserId, broadcast::Sender<StoreSnapshot>>,
}

struct MemoryAccount {
    user_id: UserId,
    password: String,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MemoryState::default()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_snapshot(state: &MemoryState, user: &UserId) {
        if let Some(feed) = state.feeds.get(user) {
            let _ = feed.send(Self::snapshot_of(state, user));
        }
    }

    fn snapshot_of(state: &MemoryState, user: &UserId) -> StoreSnapshot {
        let entries = state
            .records
            .get(user)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, value)| (TodoId::new(id.clone()), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        StoreSnapshot { entries }
    }
}

#[async_trait]
impl IdentityProvider for MemoryBackend {
    fn current_session(&self) -> Option<Identity> {
        self.inner().session.clone()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ProviderError> {
        let mut state = self.inner();
        let account = state
            .accounts
            .get(email)
            .ok_or_else(|| ProviderError::rejected("no account registered for that email"))?;
        if account.password != password {
            return Err(ProviderError::rejected("wrong password"));
        }
        let identity = Identity {
            user_id: account.user_id.clone(),
            email: Some(email.to_owned()),
        };
        state.session = Some(identity.clone());
        Ok(identity)
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, ProviderError> {
        if password.len() < 6 {
            return Err(ProviderError::rejected(
                "password must be at least 6 characters",
            ));
        }
        let mut state = self.inner();
        if state.accounts.contains_key(email) {
            return Err(ProviderError::rejected(
                "an account with that email already exists",
            ));
        }
        let user_id = UserId::new(Uuid::new_v4().to_string());
        state.accounts.insert(
            email.to_owned(),
            MemoryAccount {
                user_id: user_id.clone(),
                password: password.to_owned(),
            },
        );
        let identity = Identity {
            user_id,
            email: Some(email.to_owned()),
        };
        state.session = Some(identity.clone());
        Ok(identity)
    }

    fn sign_out(&self) -> Result<(), ProviderError> {
        self.inner().session = None;
        Ok(())
    }

    async fn exchange_external_token(&self, id_token: &str) -> Result<Identity, ProviderError> {
        if id_token.is_empty() {
            return Err(ProviderError::rejected("invalid Google token"));
        }
        let key = format!("google:{id_token}");
        let mut state = self.inner();
        let user_id = match state.accounts.get(&key) {
            Some(account) => account.user_id.clone(),
            None => {
                let user_id = UserId::new(Uuid::new_v4().to_string());
                state.accounts.insert(
                    key,
                    MemoryAccount {
                        user_id: user_id.clone(),
                        password: String::new(),
                    },
                );
                user_id
            }
        };
        let identity = Identity {
            user_id,
            email: None,
        };
        state.session = Some(identity.clone());
        Ok(identity)
    }
}

#[async_trait]
impl UserScopedStore for MemoryBackend {
    async fn subscribe(&self, user: &UserId) -> Result<SnapshotStream, StoreError> {
        // The receiver is created under the same lock as the initial
        // snapshot, so no mutation can fall between them.
        let (initial, receiver) = {
            let mut state = self.inner();
            let feed = state
                .feeds
                .entry(user.clone())
                .or_insert_with(|| broadcast::channel(SNAPSHOT_FEED_CAPACITY).0);
            let receiver = feed.subscribe();
            (Self::snapshot_of(&state, user), receiver)
        };
        let updates = BroadcastStream::new(receiver).filter_map(|delivery| async move {
            match delivery {
                Ok(snapshot) => Some(Ok(snapshot)),
                // A lagged subscriber only skips intermediate snapshots; the
                // latest one is still behind it in the channel.
                Err(BroadcastStreamRecvError::Lagged(_)) => None,
            }
        });
        Ok(futures::stream::once(async move { Ok(initial) })
            .chain(updates)
            .boxed())
    }

    fn allocate_id(&self, _user: &UserId) -> TodoId {
        TodoId::new(Uuid::new_v4().to_string())
    }

    async fn put(&self, user: &UserId, item: &TodoItem) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(item).map_err(|err| StoreError::InvalidResponse(err.to_string()))?;
        let mut state = self.inner();
        state
            .records
            .entry(user.clone())
            .or_default()
            .insert(item.id.as_str().to_owned(), value);
        Self::publish_snapshot(&state, user);
        Ok(())
    }

    async fn delete(&self, user: &UserId, id: &TodoId) -> Result<(), StoreError> {
        let mut state = self.inner();
        if let Some(records) = state.records.get_mut(user) {
            records.remove(id.as_str());
        }
        Self::publish_snapshot(&state, user);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
