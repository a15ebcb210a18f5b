use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        AuthResponse, LoginRequest, MarkReadResponse, MessagePayload, RefreshRequest,
        SendMessageRequest, TokenResponse,
    },
};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use super::*;

#[derive(Clone, Default)]
struct FakeServer {
    refresh_calls: Arc<AtomicUsize>,
    refresh_fails: Arc<AtomicBool>,
    reject_bearers: Arc<AtomicBool>,
    message_bearers: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<SendMessageRequest>>>,
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(ErrorCode::Unauthorized, "token rejected")),
    )
        .into_response()
}

async fn handle_login(Json(request): Json<LoginRequest>) -> Json<AuthResponse> {
    let user_id = request
        .email
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string();
    Json(AuthResponse {
        tokens: TokenResponse {
            access_token: format!("{user_id}-access-0"),
            refresh_token: Some(format!("{user_id}-refresh-0")),
            expires_in: Some(3600),
        },
        user: UserProfile {
            user_id: UserId::new(user_id.clone()),
            display_name: user_id.to_uppercase(),
            email: Some(request.email),
            avatar_url: None,
        },
    })
}

async fn handle_refresh(
    State(server): State<FakeServer>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let call = server.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if server.refresh_fails.load(Ordering::SeqCst) {
        return unauthorized();
    }
    let prefix = request
        .refresh_token
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string();
    Json(TokenResponse {
        access_token: format!("{prefix}-access-{call}"),
        refresh_token: Some(format!("{prefix}-refresh-{call}")),
        expires_in: Some(3600),
    })
    .into_response()
}

async fn handle_send_message(
    State(server): State<FakeServer>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    server.message_bearers.lock().await.push(bearer(&headers));
    if server.reject_bearers.load(Ordering::SeqCst) {
        return unauthorized();
    }
    server.sent.lock().await.push(request);
    StatusCode::OK.into_response()
}

async fn handle_conversation_messages(
    headers: HeaderMap,
    Path(partner): Path<String>,
) -> Response {
    if bearer(&headers).is_empty() {
        return unauthorized();
    }
    let messages: Vec<MessagePayload> = [3_000_i64, 1_000, 2_000]
        .into_iter()
        .map(|ts| MessagePayload {
            id: MessageId::new(format!("m{ts}")),
            sender_id: UserId::new(partner.clone()),
            receiver_id: UserId::from("alice"),
            body: format!("at {ts}"),
            created_at_ms: ts,
            read: false,
        })
        .collect();
    Json(messages).into_response()
}

async fn handle_mark_read() -> Json<MarkReadResponse> {
    Json(MarkReadResponse { updated: 3 })
}

async fn spawn_fake_server() -> (String, FakeServer) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = FakeServer::default();
    let app = Router::new()
        .route("/auth/login", post(handle_login))
        .route("/auth/refresh", post(handle_refresh))
        .route("/messages", post(handle_send_message))
        .route(
            "/conversations/:partner/messages",
            get(handle_conversation_messages),
        )
        .route("/conversations/:partner/read", post(handle_mark_read))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server)
}

/// Records every subscription and keeps its sender so tests can tell which are still open.
#[derive(Default)]
struct RecordingFeed {
    subscriptions: Mutex<Vec<(UserId, mpsc::Sender<FeedEvent>)>>,
}

impl RecordingFeed {
    async fn open_subscriptions(&self) -> Vec<UserId> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(user, _)| user.clone())
            .collect()
    }
}

#[async_trait]
impl RoomFeed for RecordingFeed {
    async fn subscribe(&self, user_id: &UserId) -> Result<FeedSubscription> {
        let (tx, rx) = mpsc::channel(8);
        self.subscriptions.lock().await.push((user_id.clone(), tx));
        Ok(FeedSubscription::new(rx))
    }
}

async fn client_for(base_url: &str) -> (Arc<ChatClient>, Arc<RecordingFeed>) {
    let settings = ClientSettings {
        api_base_url: base_url.to_string(),
        database_url: "sqlite::memory:".into(),
        ..ClientSettings::default()
    };
    let cache = Storage::new(&settings.database_url).await.expect("cache");
    let executor = Arc::new(
        ReqwestExecutor::new(base_url, Duration::from_secs(5)).expect("http client"),
    );
    let feed = Arc::new(RecordingFeed::default());
    let feed_for_client = feed.clone();
    let client = ChatClient::assemble(settings, cache, executor, move |_| -> Arc<dyn RoomFeed> {
        feed_for_client
    })
    .await
    .expect("client");
    (client, feed)
}

#[tokio::test]
async fn expired_token_is_refreshed_once_before_authorized_call() {
    let (base_url, server) = spawn_fake_server().await;
    let (client, _) = client_for(&base_url).await;

    client
        .login("alice@example.com", "secret")
        .await
        .expect("login");
    let mut credential = client
        .tokens()
        .current_credential()
        .await
        .expect("credential");
    credential.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
    client
        .tokens()
        .install(credential, None)
        .await
        .expect("force expiry");

    client
        .send_message(&UserId::from("bob"), "hello")
        .await
        .expect("send");

    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        server.message_bearers.lock().await.clone(),
        vec!["alice-access-1".to_string()]
    );
    let summaries = client.summaries().await.expect("summaries");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].last_message_text, "hello");
}

#[tokio::test]
async fn rejected_refresh_forces_logout() {
    let (base_url, server) = spawn_fake_server().await;
    let (client, feed) = client_for(&base_url).await;
    let mut events = client.subscribe_events();

    client
        .login("alice@example.com", "secret")
        .await
        .expect("login");
    server.reject_bearers.store(true, Ordering::SeqCst);
    server.refresh_fails.store(true, Ordering::SeqCst);

    let err = client
        .send_message(&UserId::from("bob"), "hello")
        .await
        .expect_err("session expired");
    assert_eq!(err, ClientError::SessionExpired);
    assert_eq!(server.message_bearers.lock().await.len(), 1);

    assert!(client.current_user().await.is_none());
    assert_eq!(client.sync_engine().state().await, SyncState::Idle);
    assert!(feed.open_subscriptions().await.is_empty());
    assert_eq!(
        client.summaries().await.expect_err("signed out"),
        ClientError::NotSignedIn
    );

    let event = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::SessionExpired) => return ClientEvent::SessionExpired,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("session expired event");
    assert_eq!(event, ClientEvent::SessionExpired);
}

#[tokio::test]
async fn switching_users_keeps_a_single_subscription() {
    let (base_url, _) = spawn_fake_server().await;
    let (client, feed) = client_for(&base_url).await;

    client
        .login("userA@example.com", "secret")
        .await
        .expect("login A");
    assert_eq!(feed.open_subscriptions().await, vec![UserId::from("userA")]);

    client
        .login("userB@example.com", "secret")
        .await
        .expect("login B");
    assert_eq!(feed.open_subscriptions().await, vec![UserId::from("userB")]);
    assert_eq!(
        client.sync_engine().active_user().await,
        Some(UserId::from("userB"))
    );
    assert_eq!(client.sync_engine().dedupe_len().await, 0);

    let profile = client.profile().await.expect("profile").expect("cached");
    assert_eq!(profile.display_name, "USERB");
}

#[tokio::test]
async fn synced_conversation_is_ordered_and_marked_read() {
    let (base_url, _) = spawn_fake_server().await;
    let (client, _) = client_for(&base_url).await;
    client
        .login("alice@example.com", "secret")
        .await
        .expect("login");

    let bob = UserId::from("bob");
    let messages = client.sync_conversation(&bob).await.expect("sync");
    let stamps: Vec<_> = messages
        .iter()
        .map(|m| m.created_at.timestamp_millis())
        .collect();
    assert_eq!(stamps, vec![1_000, 2_000, 3_000]);

    assert_eq!(client.mark_read(&bob).await.expect("mark read"), 3);
    assert_eq!(client.mark_read(&bob).await.expect("mark read again"), 0);
    assert!(client
        .conversation(&bob)
        .await
        .expect("conversation")
        .iter()
        .all(|m| m.read_state == ReadState::Read));
}

#[tokio::test]
async fn synced_conversation_appears_in_summaries() {
    let (base_url, _) = spawn_fake_server().await;
    let (client, _) = client_for(&base_url).await;
    client
        .login("alice@example.com", "secret")
        .await
        .expect("login");
    let mut sync_events = client.subscribe_sync();

    let bob = UserId::from("bob");
    client.sync_conversation(&bob).await.expect("sync");

    let summaries = client.summaries().await.expect("summaries");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].partner_id, bob);
    assert_eq!(summaries[0].last_message_text, "at 3000");
    assert_eq!(summaries[0].last_message_at.timestamp_millis(), 3_000);
    assert_eq!(summaries[0].unread_count, 3);

    let published = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SyncEvent::SummariesUpdated { summaries, .. }) = sync_events.recv().await {
                if !summaries.is_empty() {
                    return summaries;
                }
            }
        }
    })
    .await
    .expect("summaries published");
    assert_eq!(published, summaries);
}

#[tokio::test]
async fn logout_wipes_credential_and_cache() {
    let (base_url, _) = spawn_fake_server().await;
    let (client, feed) = client_for(&base_url).await;
    client
        .login("alice@example.com", "secret")
        .await
        .expect("login");
    client
        .send_message(&UserId::from("bob"), "bye")
        .await
        .expect("send");

    client.logout().await.expect("logout");
    assert!(client.current_user().await.is_none());
    assert!(client.profile().await.expect("profile").is_none());
    assert!(feed.open_subscriptions().await.is_empty());

    client
        .login("alice@example.com", "secret")
        .await
        .expect("login again");
    assert!(client.summaries().await.expect("summaries").is_empty());
}
