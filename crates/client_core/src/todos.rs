use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shared::domain::{StoreSnapshot, TodoId, TodoItem, UserId};

use crate::provider::UserScopedStore;

/// What the presentation layer observes for the synced collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoListState {
    Idle,
    Live(Vec<TodoItem>),
    SyncError(String),
}

impl TodoListState {
    pub fn items(&self) -> &[TodoItem] {
        match self {
            TodoListState::Live(items) => items,
            TodoListState::Idle | TodoListState::SyncError(_) => &[],
        }
    }
}

/// Mirrors one user's records out of a [`UserScopedStore`] into an
/// observable [`TodoListState`]. Each delivered snapshot replaces the
/// visible collection wholesale; edits are fire-and-forget writes back.
pub struct TodoListController {
    store: Arc<dyn UserScopedStore>,
    user: Option<UserId>,
    state: watch::Sender<TodoListState>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl TodoListController {
    pub fn new(store: Arc<dyn UserScopedStore>, user: Option<UserId>) -> Arc<Self> {
        let (state, _) = watch::channel(TodoListState::Idle);
        let controller = Arc::new(Self {
            store,
            user,
            state,
            sync_task: Mutex::new(None),
        });
        if controller.user.is_some() {
            controller.load_todos();
        }
        controller
    }

    pub fn subscribe(&self) -> watch::Receiver<TodoListState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> TodoListState {
        self.state.borrow().clone()
    }

    /// Starts the snapshot subscription, aborting any previous one.
    pub fn load_todos(self: &Arc<Self>) {
        let Some(user) = self.user.clone() else {
            debug!("load_todos without a signed-in user is a no-op");
            return;
        };
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move {
            controller.run_sync(user).await;
        });
        if let Some(previous) = self.task_slot().replace(task) {
            previous.abort();
        }
    }

    pub fn stop_sync(&self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
        self.state.send_replace(TodoListState::Idle);
    }

    pub fn add_todo(self: &Arc<Self>, item: TodoItem) {
        let Some(user) = self.user.clone() else {
            debug!("add_todo without a signed-in user is a no-op");
            return;
        };
        let item = TodoItem {
            id: self.store.allocate_id(&user),
            ..item
        };
        self.spawn_put(user, item);
    }

    pub fn update_todo(self: &Arc<Self>, item: TodoItem) {
        let Some(user) = self.user.clone() else {
            debug!("update_todo without a signed-in user is a no-op");
            return;
        };
        self.spawn_put(user, item);
    }

    pub fn delete_todo(self: &Arc<Self>, id: TodoId) {
        let Some(user) = self.user.clone() else {
            debug!("delete_todo without a signed-in user is a no-op");
            return;
        };
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = controller.store.delete(&user, &id).await {
                warn!(user_id = %user, todo_id = %id, "todo delete failed: {err}");
            }
        });
    }

    fn spawn_put(self: &Arc<Self>, user: UserId, item: TodoItem) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = controller.store.put(&user, &item).await {
                warn!(user_id = %user, todo_id = %item.id, "todo write failed: {err}");
            }
        });
    }

    async fn run_sync(self: Arc<Self>, user: UserId) {
        let mut snapshots = match self.store.subscribe(&user).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(user_id = %user, "snapshot subscription failed: {err}");
                self.state
                    .send_replace(TodoListState::SyncError(err.to_string()));
                return;
            }
        };
        while let Some(delivery) = snapshots.next().await {
            match delivery {
                Ok(snapshot) => {
                    self.state
                        .send_replace(TodoListState::Live(decode_snapshot(&snapshot)));
                }
                Err(err) => {
                    warn!(user_id = %user, "snapshot stream failed: {err}");
                    self.state
                        .send_replace(TodoListState::SyncError(err.to_string()));
                    return;
                }
            }
        }
        debug!(user_id = %user, "snapshot stream closed");
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sync_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TodoListController {
    fn drop(&mut self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
    }
}

/// A record that no longer parses is skipped rather than failing the list.
fn decode_snapshot(snapshot: &StoreSnapshot) -> Vec<TodoItem> {
    let mut items = Vec::with_capacity(snapshot.len());
    for (id, value) in &snapshot.entries {
        match serde_json::from_value::<TodoItem>(value.clone()) {
            Ok(item) => items.push(item),
            Err(err) => warn!(todo_id = %id, "skipping malformed todo record: {err}"),
        }
    }
    items
}

#[cfg(test)]
#[path = "tests/todos_tests.rs"]
mod tests;
