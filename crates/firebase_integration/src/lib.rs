use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use client_core::{IdentityProvider, SnapshotStream, UserScopedStore};
use shared::{
    domain::{Identity, StoreSnapshot, TodoId, TodoItem, UserId},
    error::{ProviderError, StoreError},
};

mod mirror;
mod sse;

use mirror::ScopeMirror;
use sse::{SseEvent, SseParser};

const DEFAULT_AUTH_ORIGIN: &str = "https://identitytoolkit.googleapis.com";
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Connection settings for one Firebase project.
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub api_key: String,
    /// Realtime Database origin, e.g. `https://myapp-default-rtdb.firebaseio.com`.
    pub database_url: String,
    /// Identity Toolkit origin; overridable so tests can point it at a stub.
    pub auth_origin: String,
}

impl FirebaseConfig {
    pub fn new(api_key: impl Into<String>, database_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            database_url: database_url.into(),
            auth_origin: DEFAULT_AUTH_ORIGIN.to_string(),
        }
    }

    pub fn with_auth_origin(mut self, auth_origin: impl Into<String>) -> Self {
        self.auth_origin = auth_origin.into();
        self
    }
}

#[derive(Debug, Error)]
#[error("invalid database url {url:?}: {reason}")]
pub struct InvalidDatabaseUrl {
    url: String,
    reason: String,
}

#[derive(Debug, Clone)]
struct FirebaseSession {
    identity: Identity,
    id_token: String,
    expires_at: Instant,
}

/// Identity Toolkit client holding the session for this process. Sessions
/// are not persisted and are dropped once the id token expires; callers see
/// that as `current_session` turning `None`.
pub struct FirebaseIdentityProvider {
    http: Client,
    config: FirebaseConfig,
    session: Mutex<Option<FirebaseSession>>,
}

impl FirebaseIdentityProvider {
    pub fn new(config: FirebaseConfig) -> Arc<Self> {
        Arc::new(Self {
            http: Client::new(),
            config,
            session: Mutex::new(None),
        })
    }

    /// Bearer token of the live session, if one is active and unexpired.
    pub fn id_token(&self) -> Option<String> {
        let session = self.session_slot();
        session
            .as_ref()
            .filter(|session| session.expires_at > Instant::now())
            .map(|session| session.id_token.clone())
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<FirebaseSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn token_request<B>(&self, operation: &str, body: &B) -> Result<Identity, ProviderError>
    where
        B: Serialize + Sync,
    {
        let url = format!("{}/v1/accounts:{operation}", self.config.auth_origin);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(rejection_from(response).await);
        }
        let granted: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        self.store_session(granted)
    }

    fn store_session(&self, granted: TokenResponse) -> Result<Identity, ProviderError> {
        let expires_in: u64 = granted.expires_in.parse().map_err(|_| {
            ProviderError::InvalidResponse(format!("non-numeric expiresIn {:?}", granted.expires_in))
        })?;
        let identity = Identity {
            user_id: UserId::new(granted.local_id),
            email: granted.email.filter(|email| !email.is_empty()),
        };
        *self.session_slot() = Some(FirebaseSession {
            identity: identity.clone(),
            id_token: granted.id_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityProvider {
    fn current_session(&self) -> Option<Identity> {
        let session = self.session_slot();
        session
            .as_ref()
            .filter(|session| session.expires_at > Instant::now())
            .map(|session| session.identity.clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ProviderError> {
        self.token_request(
            "signInWithPassword",
            &PasswordCredentials {
                email,
                password,
                return_secure_token: true,
            },
        )
        .await
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, ProviderError> {
        self.token_request(
            "signUp",
            &PasswordCredentials {
                email,
                password,
                return_secure_token: true,
            },
        )
        .await
    }

    fn sign_out(&self) -> Result<(), ProviderError> {
        *self.session_slot() = None;
        Ok(())
    }

    async fn exchange_external_token(&self, id_token: &str) -> Result<Identity, ProviderError> {
        self.token_request(
            "signInWithIdp",
            &IdpCredentials {
                post_body: format!("id_token={id_token}&providerId=google.com"),
                request_uri: "http://localhost",
                return_secure_token: true,
                return_idp_credential: true,
            },
        )
        .await
    }
}

async fn rejection_from(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    match response.json::<ErrorEnvelope>().await {
        Ok(envelope) => ProviderError::rejected(envelope.error.message),
        Err(_) => ProviderError::InvalidResponse(format!(
            "status {status} with an unreadable error body"
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordCredentials<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdpCredentials<'a> {
    post_body: String,
    request_uri: &'a str,
    return_secure_token: bool,
    return_idp_credential: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    id_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Realtime Database client for the per-user `todos/{uid}` scope. Reads come
/// in over a streaming REST connection as `put`/`patch` deltas; a
/// [`ScopeMirror`] turns every delta into a full snapshot.
pub struct FirebaseTodoStore {
    http: Client,
    database_url: Url,
    auth: Arc<FirebaseIdentityProvider>,
}

impl FirebaseTodoStore {
    pub fn new(
        config: &FirebaseConfig,
        auth: Arc<FirebaseIdentityProvider>,
    ) -> Result<Arc<Self>, InvalidDatabaseUrl> {
        let database_url = Url::parse(&config.database_url).map_err(|err| InvalidDatabaseUrl {
            url: config.database_url.clone(),
            reason: err.to_string(),
        })?;
        if database_url.cannot_be_a_base() {
            return Err(InvalidDatabaseUrl {
                url: config.database_url.clone(),
                reason: "url cannot hold a path".to_string(),
            });
        }
        Ok(Arc::new(Self {
            http: Client::new(),
            database_url,
            auth,
        }))
    }

    fn bearer(&self) -> Result<String, StoreError> {
        self.auth
            .id_token()
            .ok_or_else(|| StoreError::Unauthorized("no active session".to_string()))
    }

    fn resource_url(&self, segments: &[&str], token: &str) -> Url {
        let mut url = self.database_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        url.query_pairs_mut().append_pair("auth", token);
        url
    }

    fn scope_url(&self, user: &UserId, token: &str) -> Url {
        self.resource_url(&["todos", &format!("{}.json", user.as_str())], token)
    }

    fn record_url(&self, user: &UserId, id: &TodoId, token: &str) -> Url {
        self.resource_url(
            &["todos", user.as_str(), &format!("{}.json", id.as_str())],
            token,
        )
    }
}

#[async_trait]
impl UserScopedStore for FirebaseTodoStore {
    async fn subscribe(&self, user: &UserId) -> Result<SnapshotStream, StoreError> {
        let token = self.bearer()?;
        let response = self
            .http
            .get(self.scope_url(user, &token))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        let response = check_store_status(response)?;

        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        tokio::spawn(stream_snapshots(response, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }

    fn allocate_id(&self, _user: &UserId) -> TodoId {
        TodoId::new(Uuid::new_v4().to_string())
    }

    async fn put(&self, user: &UserId, item: &TodoItem) -> Result<(), StoreError> {
        let token = self.bearer()?;
        let response = self
            .http
            .put(self.record_url(user, &item.id, &token))
            .json(item)
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        check_store_status(response)?;
        Ok(())
    }

    async fn delete(&self, user: &UserId, id: &TodoId) -> Result<(), StoreError> {
        let token = self.bearer()?;
        let response = self
            .http
            .delete(self.record_url(user, id, &token))
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        check_store_status(response)?;
        Ok(())
    }
}

fn check_store_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(StoreError::Unauthorized(format!("store returned {status}")));
    }
    if !status.is_success() {
        return Err(StoreError::Transport(format!("store returned {status}")));
    }
    Ok(response)
}

async fn stream_snapshots(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StoreSnapshot, StoreError>>,
) {
    let mut chunks = response.bytes_stream();
    let mut parser = SseParser::default();
    let mut mirror = ScopeMirror::default();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(StoreError::Transport(err.to_string()))).await;
                return;
            }
        };
        for event in parser.push(&chunk) {
            match apply_event(&mut mirror, event) {
                EventOutcome::Snapshot(snapshot) => {
                    if tx.send(Ok(snapshot)).await.is_err() {
                        return;
                    }
                }
                EventOutcome::Ignore => {}
                EventOutcome::Fatal(err) => {
                    warn!("event stream failed: {err}");
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }
    let _ = tx
        .send(Err(StoreError::Transport(
            "event stream ended unexpectedly".to_string(),
        )))
        .await;
}

enum EventOutcome {
    Snapshot(StoreSnapshot),
    Ignore,
    Fatal(StoreError),
}

fn apply_event(mirror: &mut ScopeMirror, event: SseEvent) -> EventOutcome {
    match event.name.as_str() {
        "put" | "patch" => {
            let delta: StreamDelta = match serde_json::from_str(&event.data) {
                Ok(delta) => delta,
                Err(err) => {
                    return EventOutcome::Fatal(StoreError::InvalidResponse(format!(
                        "bad {} event: {err}",
                        event.name
                    )))
                }
            };
            if event.name == "put" {
                mirror.apply_put(&delta.path, delta.data);
            } else {
                mirror.apply_patch(&delta.path, delta.data);
            }
            EventOutcome::Snapshot(mirror.snapshot())
        }
        "keep-alive" => EventOutcome::Ignore,
        "cancel" => EventOutcome::Fatal(StoreError::Unauthorized(
            "the backend revoked read access".to_string(),
        )),
        "auth_revoked" => EventOutcome::Fatal(StoreError::Unauthorized(
            "auth token expired".to_string(),
        )),
        other => {
            debug!("ignoring unrecognized stream event {other:?}");
            EventOutcome::Ignore
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    path: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
