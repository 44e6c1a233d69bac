use super::*;
use std::convert::Infallible;

use axum::{
    body::to_bytes,
    extract::{Request, State},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone)]
enum AuthReply {
    Grant(serde_json::Value),
    Deny { status: u16, message: String },
}

#[derive(Clone)]
struct AuthStub {
    reply: AuthReply,
    requests: mpsc::UnboundedSender<(String, serde_json::Value)>,
}

async fn handle_auth(State(stub): State<AuthStub>, request: Request) -> Response {
    let target = request
        .uri()
        .path_and_query()
        .map(|target| target.to_string())
        .unwrap_or_default();
    let bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .expect("request body");
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    let _ = stub.requests.send((target, body));
    match stub.reply {
        AuthReply::Grant(granted) => Json(granted).into_response(),
        AuthReply::Deny { status, message } => (
            StatusCode::from_u16(status).expect("status code"),
            Json(json!({"error": {"code": status, "message": message}})),
        )
            .into_response(),
    }
}

async fn spawn_auth_stub(
    reply: AuthReply,
) -> (String, mpsc::UnboundedReceiver<(String, serde_json::Value)>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().fallback(handle_auth).with_state(AuthStub {
        reply,
        requests: tx,
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), rx)
}

fn grant(uid: &str, email: &str, token: &str) -> AuthReply {
    AuthReply::Grant(json!({
        "localId": uid,
        "email": email,
        "idToken": token,
        "refreshToken": "refresh-1",
        "expiresIn": "3600",
    }))
}

fn config_for(auth_origin: &str, database_url: &str) -> FirebaseConfig {
    FirebaseConfig::new("test-api-key", database_url).with_auth_origin(auth_origin)
}

#[tokio::test]
async fn sign_in_grants_a_session() {
    let (origin, mut requests) =
        spawn_auth_stub(grant("uid-1", "alice@example.com", "token-1")).await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));

    let identity = provider
        .sign_in("alice@example.com", "hunter22")
        .await
        .expect("sign in");
    assert_eq!(identity.user_id, UserId::new("uid-1"));
    assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
    assert_eq!(provider.current_session(), Some(identity));
    assert_eq!(provider.id_token().as_deref(), Some("token-1"));

    let (target, body) = requests.recv().await.expect("recorded request");
    assert_eq!(target, "/v1/accounts:signInWithPassword?key=test-api-key");
    assert_eq!(
        body,
        json!({"email": "alice@example.com", "password": "hunter22", "returnSecureToken": true})
    );
}

#[tokio::test]
async fn sign_in_surfaces_the_backend_rejection_message() {
    let (origin, _requests) = spawn_auth_stub(AuthReply::Deny {
        status: 400,
        message: "INVALID_PASSWORD".to_string(),
    })
    .await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));

    let err = provider
        .sign_in("alice@example.com", "wrong")
        .await
        .expect_err("must fail");
    assert_eq!(err, ProviderError::rejected("INVALID_PASSWORD"));
    assert_eq!(provider.current_session(), None);
}

#[tokio::test]
async fn create_account_posts_to_the_sign_up_endpoint() {
    let (origin, mut requests) =
        spawn_auth_stub(grant("uid-2", "bob@example.com", "token-2")).await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));

    let identity = provider
        .create_account("bob@example.com", "hunter22")
        .await
        .expect("create account");
    assert_eq!(identity.user_id, UserId::new("uid-2"));

    let (target, body) = requests.recv().await.expect("recorded request");
    assert_eq!(target, "/v1/accounts:signUp?key=test-api-key");
    assert_eq!(body["returnSecureToken"], json!(true));
}

#[tokio::test]
async fn google_exchange_posts_the_idp_payload() {
    let (origin, mut requests) = spawn_auth_stub(grant("uid-3", "", "token-3")).await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));

    let identity = provider
        .exchange_external_token("google-id-token")
        .await
        .expect("exchange");
    assert_eq!(identity.user_id, UserId::new("uid-3"));
    assert_eq!(identity.email, None);

    let (target, body) = requests.recv().await.expect("recorded request");
    assert_eq!(target, "/v1/accounts:signInWithIdp?key=test-api-key");
    assert_eq!(
        body["postBody"],
        json!("id_token=google-id-token&providerId=google.com")
    );
    assert_eq!(body["requestUri"], json!("http://localhost"));
    assert_eq!(body["returnIdpCredential"], json!(true));
}

#[tokio::test]
async fn sign_out_drops_the_session() {
    let (origin, _requests) =
        spawn_auth_stub(grant("uid-1", "alice@example.com", "token-1")).await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));
    provider
        .sign_in("alice@example.com", "hunter22")
        .await
        .expect("sign in");

    provider.sign_out().expect("sign out");

    assert_eq!(provider.current_session(), None);
    assert_eq!(provider.id_token(), None);
}

#[tokio::test]
async fn expired_sessions_are_not_reported() {
    let (origin, _requests) = spawn_auth_stub(AuthReply::Grant(json!({
        "localId": "uid-1",
        "email": "alice@example.com",
        "idToken": "token-1",
        "expiresIn": "0",
    })))
    .await;
    let provider = FirebaseIdentityProvider::new(config_for(&origin, "http://unused.invalid"));
    provider
        .sign_in("alice@example.com", "hunter22")
        .await
        .expect("sign in");

    assert_eq!(provider.current_session(), None);
    assert_eq!(provider.id_token(), None);
}

#[derive(Clone)]
struct RtdbStub {
    events: Vec<(&'static str, String)>,
    requests: mpsc::UnboundedSender<RtdbRequest>,
}

#[derive(Debug)]
struct RtdbRequest {
    method: String,
    target: String,
    accept: String,
    body: serde_json::Value,
}

async fn handle_rtdb(State(stub): State<RtdbStub>, request: Request) -> Response {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|target| target.to_string())
        .unwrap_or_default();
    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = to_bytes(request.into_body(), usize::MAX)
        .await
        .expect("request body");
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    let _ = stub.requests.send(RtdbRequest {
        method: method.clone(),
        target,
        accept,
        body,
    });
    if method == "GET" {
        let stream = futures::stream::iter(stub.events.clone().into_iter().map(|(name, data)| {
            Ok::<_, Infallible>(Event::default().event(name).data(data))
        }))
        .chain(futures::stream::pending());
        Sse::new(stream).into_response()
    } else {
        Json(serde_json::Value::Null).into_response()
    }
}

async fn spawn_rtdb_stub(
    events: Vec<(&'static str, String)>,
) -> (String, mpsc::UnboundedReceiver<RtdbRequest>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().fallback(handle_rtdb).with_state(RtdbStub {
        events,
        requests: tx,
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), rx)
}

async fn signed_in_store(
    events: Vec<(&'static str, String)>,
) -> (
    Arc<FirebaseIdentityProvider>,
    Arc<FirebaseTodoStore>,
    mpsc::UnboundedReceiver<RtdbRequest>,
) {
    let (auth_origin, _auth_requests) =
        spawn_auth_stub(grant("uid-1", "alice@example.com", "token-1")).await;
    let (database_url, rtdb_requests) = spawn_rtdb_stub(events).await;
    let config = config_for(&auth_origin, &database_url);
    let provider = FirebaseIdentityProvider::new(config.clone());
    provider
        .sign_in("alice@example.com", "hunter22")
        .await
        .expect("sign in");
    let store = FirebaseTodoStore::new(&config, Arc::clone(&provider)).expect("valid database url");
    (provider, store, rtdb_requests)
}

fn entry_ids(snapshot: &StoreSnapshot) -> Vec<String> {
    snapshot
        .entries
        .iter()
        .map(|(id, _)| id.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn put_writes_the_record_under_the_user_scope() {
    let (_provider, store, mut requests) = signed_in_store(Vec::new()).await;
    let item = TodoItem {
        id: TodoId::new("item-1"),
        title: "Buy milk".to_string(),
        completed: false,
    };

    store.put(&UserId::new("uid-1"), &item).await.expect("put");

    let request = requests.recv().await.expect("recorded request");
    assert_eq!(request.method, "PUT");
    assert_eq!(request.target, "/todos/uid-1/item-1.json?auth=token-1");
    assert_eq!(
        request.body,
        json!({"id": "item-1", "title": "Buy milk", "completed": false})
    );
}

#[tokio::test]
async fn delete_removes_the_record() {
    let (_provider, store, mut requests) = signed_in_store(Vec::new()).await;

    store
        .delete(&UserId::new("uid-1"), &TodoId::new("item-1"))
        .await
        .expect("delete");

    let request = requests.recv().await.expect("recorded request");
    assert_eq!(request.method, "DELETE");
    assert_eq!(request.target, "/todos/uid-1/item-1.json?auth=token-1");
}

#[tokio::test]
async fn store_calls_without_a_session_fail_locally() {
    let (provider, store, mut requests) = signed_in_store(Vec::new()).await;
    provider.sign_out().expect("sign out");

    let err = store
        .put(&UserId::new("uid-1"), &TodoItem::new("Buy milk"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, StoreError::Unauthorized(_)));

    let err = store.subscribe(&UserId::new("uid-1")).await.err();
    assert!(matches!(err, Some(StoreError::Unauthorized(_))));
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn subscribe_turns_stream_deltas_into_full_snapshots() {
    let events = vec![
        (
            "put",
            json!({"path": "/", "data": {"a": {"id": "a", "title": "Buy milk", "completed": false}}})
                .to_string(),
        ),
        ("keep-alive", "null".to_string()),
        (
            "put",
            json!({"path": "/b", "data": {"id": "b", "title": "Walk dog", "completed": false}})
                .to_string(),
        ),
        ("patch", json!({"path": "/a", "data": {"completed": true}}).to_string()),
        ("put", json!({"path": "/b", "data": null}).to_string()),
    ];
    let (_provider, store, mut requests) = signed_in_store(events).await;

    let mut snapshots = store
        .subscribe(&UserId::new("uid-1"))
        .await
        .expect("subscribe");

    let request = requests.recv().await.expect("recorded request");
    assert_eq!(request.method, "GET");
    assert_eq!(request.target, "/todos/uid-1.json?auth=token-1");
    assert_eq!(request.accept, "text/event-stream");

    let first = snapshots.next().await.expect("first").expect("snapshot");
    assert_eq!(entry_ids(&first), vec!["a".to_string()]);

    let second = snapshots.next().await.expect("second").expect("snapshot");
    assert_eq!(entry_ids(&second), vec!["a".to_string(), "b".to_string()]);

    let third = snapshots.next().await.expect("third").expect("snapshot");
    let record = third
        .entries
        .iter()
        .find(|(id, _)| id.as_str() == "a")
        .map(|(_, value)| value.clone())
        .expect("record a");
    assert_eq!(record["completed"], json!(true));
    assert_eq!(record["title"], json!("Buy milk"));

    let fourth = snapshots.next().await.expect("fourth").expect("snapshot");
    assert_eq!(entry_ids(&fourth), vec!["a".to_string()]);
}

#[tokio::test]
async fn a_revoked_token_fails_the_stream() {
    let events = vec![
        ("put", json!({"path": "/", "data": null}).to_string()),
        ("auth_revoked", "\"token expired\"".to_string()),
    ];
    let (_provider, store, _requests) = signed_in_store(events).await;

    let mut snapshots = store
        .subscribe(&UserId::new("uid-1"))
        .await
        .expect("subscribe");

    let first = snapshots.next().await.expect("first").expect("snapshot");
    assert!(first.is_empty());

    let err = snapshots
        .next()
        .await
        .expect("second delivery")
        .expect_err("stream must fail");
    assert!(matches!(err, StoreError::Unauthorized(_)));
}

#[test]
fn an_unparseable_database_url_is_rejected_up_front() {
    let config = FirebaseConfig::new("test-api-key", "not a url");
    let provider = FirebaseIdentityProvider::new(config.clone());
    assert!(FirebaseTodoStore::new(&config, provider).is_err());
}
