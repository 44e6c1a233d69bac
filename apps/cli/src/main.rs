use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use client_core::{
    AuthController, AuthState, IdentityProvider, MemoryBackend, TodoListController, TodoListState,
    UserScopedStore,
};
use firebase_integration::{FirebaseConfig, FirebaseIdentityProvider, FirebaseTodoStore};
use shared::domain::{Identity, TodoId, TodoItem};

mod settings;
use settings::{load_settings, BackendKind, Settings};

#[derive(Parser, Debug)]
#[command(name = "todo", about = "Synchronized to-do list client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted session against the in-process backend.
    Demo,
    /// Create an account with the configured credentials.
    Register {
        /// Repeat of the password; defaults to the configured one.
        #[arg(long)]
        confirm_password: Option<String>,
    },
    /// Verify the configured credentials.
    Login,
    /// Complete a Google sign-in with an id token obtained elsewhere.
    Google { id_token: String },
    /// Add a new to-do.
    Add { title: String },
    /// Mark a to-do as completed.
    Done { id: String },
    /// Mark a to-do as open again.
    Undone { id: String },
    /// Remove a to-do.
    Rm { id: String },
    /// Print the current to-dos.
    Ls,
    /// Follow the list and print every change.
    Watch,
    /// Sign in, then sign out again.
    Logout,
}

struct Backend {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn UserScopedStore>,
}

fn build_backend(settings: &Settings) -> Result<Backend> {
    match settings.backend {
        BackendKind::Memory => {
            let backend = MemoryBackend::new();
            Ok(Backend {
                provider: backend.clone(),
                store: backend,
            })
        }
        BackendKind::Firebase => {
            if settings.api_key.is_empty() || settings.database_url.is_empty() {
                bail!(
                    "the firebase backend needs api_key and database_url \
                     (todo.toml or TODO_API_KEY / TODO_DATABASE_URL)"
                );
            }
            let config = FirebaseConfig::new(&settings.api_key, &settings.database_url);
            let provider = FirebaseIdentityProvider::new(config.clone());
            let store = FirebaseTodoStore::new(&config, Arc::clone(&provider))?;
            Ok(Backend { provider, store })
        }
    }
}

fn credentials(settings: &Settings) -> Result<(String, String)> {
    match (&settings.email, &settings.password) {
        (Some(email), Some(password)) => Ok((email.clone(), password.clone())),
        _ => bail!(
            "credentials missing: set email and password in todo.toml \
             or TODO_EMAIL / TODO_PASSWORD"
        ),
    }
}

async fn settled_auth(rx: &mut watch::Receiver<AuthState>) -> AuthState {
    loop {
        let state = rx.borrow_and_update().clone();
        if !matches!(state, AuthState::Loading) {
            return state;
        }
        if rx.changed().await.is_err() {
            return AuthState::Unauthenticated;
        }
    }
}

fn expect_authenticated(state: AuthState, action: &str) -> Result<Identity> {
    match state {
        AuthState::Authenticated(identity) => Ok(identity),
        AuthState::Error(message) => bail!("{action} failed: {message}"),
        state => bail!("{action} ended in unexpected state {state:?}"),
    }
}

async fn sign_in(backend: &Backend, settings: &Settings) -> Result<Identity> {
    let (email, password) = credentials(settings)?;
    let auth = AuthController::new(Arc::clone(&backend.provider));
    let mut rx = auth.subscribe();
    auth.login(&email, &password);
    expect_authenticated(settled_auth(&mut rx).await, "sign in")
}

struct TodoSession {
    todos: Arc<TodoListController>,
    state_rx: watch::Receiver<TodoListState>,
    items: Vec<TodoItem>,
}

async fn open_todos(backend: &Backend, settings: &Settings) -> Result<TodoSession> {
    let identity = sign_in(backend, settings).await?;
    let todos = TodoListController::new(Arc::clone(&backend.store), Some(identity.user_id));
    let mut state_rx = todos.subscribe();
    let items = wait_for_live(&mut state_rx).await?;
    Ok(TodoSession {
        todos,
        state_rx,
        items,
    })
}

async fn wait_for_live(rx: &mut watch::Receiver<TodoListState>) -> Result<Vec<TodoItem>> {
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            TodoListState::Live(items) => return Ok(items),
            TodoListState::SyncError(message) => bail!("sync failed: {message}"),
            TodoListState::Idle => {
                if rx.changed().await.is_err() {
                    bail!("the todo list went away");
                }
            }
        }
    }
}

async fn next_live(rx: &mut watch::Receiver<TodoListState>) -> Result<Vec<TodoItem>> {
    loop {
        if rx.changed().await.is_err() {
            bail!("the todo list went away");
        }
        match rx.borrow_and_update().clone() {
            TodoListState::Live(items) => return Ok(items),
            TodoListState::SyncError(message) => bail!("sync failed: {message}"),
            TodoListState::Idle => {}
        }
    }
}

fn find_item(items: &[TodoItem], id: &str) -> Result<TodoItem> {
    if let Some(item) = items.iter().find(|item| item.id.as_str() == id) {
        return Ok(item.clone());
    }
    let mut matches = items.iter().filter(|item| item.id.as_str().starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item.clone()),
        (Some(_), Some(_)) => bail!("id prefix {id:?} is ambiguous"),
        _ => bail!("no todo with id {id:?}"),
    }
}

fn short_id(id: &TodoId) -> &str {
    let id = id.as_str();
    id.get(..8).unwrap_or(id)
}

fn display_name(identity: &Identity) -> String {
    identity
        .email
        .clone()
        .unwrap_or_else(|| identity.user_id.to_string())
}

fn print_items(items: &[TodoItem]) {
    if items.is_empty() {
        println!("nothing to do");
        return;
    }
    for item in items {
        let mark = if item.completed { "x" } else { " " };
        println!("[{mark}] {}  {}", short_id(&item.id), item.title);
    }
}

async fn run_demo() -> Result<()> {
    let backend = MemoryBackend::new();

    let auth = AuthController::new(backend.clone());
    let mut auth_rx = auth.subscribe();
    println!("registering demo@example.com");
    auth.register("demo@example.com", "hunter22", "hunter22");
    let identity = expect_authenticated(settled_auth(&mut auth_rx).await, "registration")?;
    println!("authenticated as {}", identity.user_id);

    let todos = TodoListController::new(backend.clone(), Some(identity.user_id.clone()));
    let mut rx = todos.subscribe();
    wait_for_live(&mut rx).await?;

    println!("adding two todos");
    todos.add_todo(TodoItem::new("Buy milk"));
    next_live(&mut rx).await?;
    todos.add_todo(TodoItem::new("Walk the dog"));
    let items = next_live(&mut rx).await?;
    print_items(&items);

    let first = items.first().context("the list cannot be empty here")?.clone();
    println!("completing {:?}", first.title);
    todos.update_todo(TodoItem {
        completed: true,
        ..first.clone()
    });
    let items = next_live(&mut rx).await?;
    print_items(&items);

    println!("removing {:?}", first.title);
    todos.delete_todo(first.id);
    let items = next_live(&mut rx).await?;
    print_items(&items);

    println!("logging out");
    todos.stop_sync();
    auth.logout();
    println!("final auth state: {:?}", auth.state());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();
    let settings = load_settings();

    match cli.command {
        Command::Demo => run_demo().await?,
        Command::Register { confirm_password } => {
            let backend = build_backend(&settings)?;
            let (email, password) = credentials(&settings)?;
            let auth = AuthController::new(Arc::clone(&backend.provider));
            let mut rx = auth.subscribe();
            let confirm = confirm_password.unwrap_or_else(|| password.clone());
            auth.register(&email, &password, &confirm);
            let identity = expect_authenticated(settled_auth(&mut rx).await, "registration")?;
            println!("registered {}", display_name(&identity));
        }
        Command::Login => {
            let backend = build_backend(&settings)?;
            let identity = sign_in(&backend, &settings).await?;
            println!("signed in as {}", display_name(&identity));
        }
        Command::Google { id_token } => {
            let backend = build_backend(&settings)?;
            let auth = AuthController::new(Arc::clone(&backend.provider));
            let mut rx = auth.subscribe();
            auth.login_with_google(&id_token);
            let identity = expect_authenticated(settled_auth(&mut rx).await, "google sign in")?;
            println!("signed in as {}", display_name(&identity));
        }
        Command::Add { title } => {
            if title.trim().is_empty() {
                bail!("the title can't be empty");
            }
            let backend = build_backend(&settings)?;
            let mut session = open_todos(&backend, &settings).await?;
            session.todos.add_todo(TodoItem::new(title));
            let items = next_live(&mut session.state_rx).await?;
            print_items(&items);
        }
        Command::Done { id } => {
            let backend = build_backend(&settings)?;
            let mut session = open_todos(&backend, &settings).await?;
            let target = find_item(&session.items, &id)?;
            session.todos.update_todo(TodoItem {
                completed: true,
                ..target
            });
            let items = next_live(&mut session.state_rx).await?;
            print_items(&items);
        }
        Command::Undone { id } => {
            let backend = build_backend(&settings)?;
            let mut session = open_todos(&backend, &settings).await?;
            let target = find_item(&session.items, &id)?;
            session.todos.update_todo(TodoItem {
                completed: false,
                ..target
            });
            let items = next_live(&mut session.state_rx).await?;
            print_items(&items);
        }
        Command::Rm { id } => {
            let backend = build_backend(&settings)?;
            let mut session = open_todos(&backend, &settings).await?;
            let target = find_item(&session.items, &id)?;
            session.todos.delete_todo(target.id);
            let items = next_live(&mut session.state_rx).await?;
            print_items(&items);
        }
        Command::Ls => {
            let backend = build_backend(&settings)?;
            let session = open_todos(&backend, &settings).await?;
            print_items(&session.items);
        }
        Command::Watch => {
            let backend = build_backend(&settings)?;
            let identity = sign_in(&backend, &settings).await?;
            println!("watching todos for {} (ctrl-c to stop)", display_name(&identity));
            let todos = TodoListController::new(Arc::clone(&backend.store), Some(identity.user_id));
            let mut rx = todos.subscribe();
            loop {
                match rx.borrow_and_update().clone() {
                    TodoListState::Idle => {}
                    TodoListState::Live(items) => {
                        print_items(&items);
                        println!();
                    }
                    TodoListState::SyncError(message) => bail!("sync failed: {message}"),
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Command::Logout => {
            let backend = build_backend(&settings)?;
            let identity = sign_in(&backend, &settings).await?;
            let auth = AuthController::new(Arc::clone(&backend.provider));
            auth.logout();
            println!("signed out {}", display_name(&identity));
        }
    }

    Ok(())
}
