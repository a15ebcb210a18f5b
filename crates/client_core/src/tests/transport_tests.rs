use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use chrono::Utc;
use shared::{
    domain::{Credential, UserId},
    error::ErrorCode,
    protocol::TokenResponse,
};
use tokio::sync::Mutex;

use super::*;
use crate::{
    credentials::SqliteCredentialStore,
    token_manager::{SessionEvent, TokenRefresher},
};

/// Replays canned status codes and records the bearer each call carried.
struct ScriptedExecutor {
    statuses: Mutex<VecDeque<u16>>,
    bearers: Mutex<Vec<Option<String>>>,
}

impl ScriptedExecutor {
    fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            bearers: Mutex::new(Vec::new()),
        })
    }

    async fn bearers(&self) -> Vec<Option<String>> {
        self.bearers.lock().await.clone()
    }
}

#[async_trait]
impl HttpExecutor for ScriptedExecutor {
    async fn execute(&self, _request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        self.bearers.lock().await.push(bearer.map(str::to_string));
        let status = self.statuses.lock().await.pop_front().unwrap_or(200);
        let body = if status == 200 {
            br#"{"ok":true}"#.to_vec()
        } else {
            serde_json::to_vec(&ApiError::new(ErrorCode::Validation, "bad input")).expect("body")
        };
        Ok(ApiResponse { status, body })
    }
}

struct SequentialRefresher {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenRefresher for SequentialRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenResponse {
            access_token: format!("renewed-{call}"),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

async fn signed_in_tokens() -> (Arc<TokenManager>, Arc<SequentialRefresher>) {
    let storage = storage::Storage::new("sqlite::memory:").await.expect("db");
    let refresher = Arc::new(SequentialRefresher {
        calls: AtomicUsize::new(0),
    });
    let tokens = TokenManager::initialize(
        Arc::new(SqliteCredentialStore::new(storage)),
        refresher.clone(),
        chrono::Duration::seconds(60),
    )
    .await
    .expect("manager");
    tokens
        .install(
            Credential {
                access_token: "initial".into(),
                refresh_token: Some("refresh".into()),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                subject_user_id: UserId::from("u1"),
            },
            None,
        )
        .await
        .expect("install");
    (tokens, refresher)
}

#[tokio::test]
async fn authorized_request_carries_bearer() {
    let (tokens, refresher) = signed_in_tokens().await;
    let executor = ScriptedExecutor::new(&[200]);
    let transport = AuthorizingTransport::new(executor.clone(), tokens);

    let body: Value = transport
        .send_json(&ApiRequest::get("/conversations"))
        .await
        .expect("response");
    assert_eq!(body["ok"], true);
    assert_eq!(executor.bearers().await, vec![Some("initial".to_string())]);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn untagged_request_passes_through_without_token() {
    let (tokens, _) = signed_in_tokens().await;
    let executor = ScriptedExecutor::new(&[401]);
    let transport = AuthorizingTransport::new(executor.clone(), tokens);

    let response = transport
        .send(&ApiRequest::post("/auth/login").unauthenticated())
        .await
        .expect("response");
    assert!(response.is_unauthorized());
    assert_eq!(executor.bearers().await, vec![None]);
}

#[tokio::test]
async fn single_401_refreshes_and_retries_once() {
    let (tokens, refresher) = signed_in_tokens().await;
    let executor = ScriptedExecutor::new(&[401, 200]);
    let transport = AuthorizingTransport::new(executor.clone(), tokens);

    transport
        .send_unit(&ApiRequest::post("/conversations/u2/read"))
        .await
        .expect("retried call succeeds");
    assert_eq!(
        executor.bearers().await,
        vec![Some("initial".to_string()), Some("renewed-1".to_string())]
    );
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_401_is_session_expired_without_third_attempt() {
    let (tokens, _) = signed_in_tokens().await;
    let mut events = tokens.subscribe_session_events();
    let executor = ScriptedExecutor::new(&[401, 401, 200]);
    let transport = AuthorizingTransport::new(executor.clone(), tokens);

    let err = transport
        .send(&ApiRequest::get("/me"))
        .await
        .expect_err("expired");
    assert_eq!(err, ClientError::SessionExpired);
    assert_eq!(executor.bearers().await.len(), 2);
    assert_eq!(events.recv().await.expect("event"), SessionEvent::Expired);
}

#[tokio::test]
async fn non_auth_failures_surface_as_api_errors() {
    let (tokens, _) = signed_in_tokens().await;
    let executor = ScriptedExecutor::new(&[422]);
    let transport = AuthorizingTransport::new(executor, tokens);

    let err = transport
        .send_unit(&ApiRequest::post("/messages"))
        .await
        .expect_err("validation");
    assert_eq!(
        err,
        ClientError::Api {
            status: 422,
            message: "bad input".into()
        }
    );
}

#[test]
fn error_body_without_payload_uses_raw_text() {
    let response = ApiResponse {
        status: 503,
        body: b" upstream unavailable\n".to_vec(),
    };
    assert_eq!(
        response.into_error(),
        ClientError::Api {
            status: 503,
            message: "upstream unavailable".into()
        }
    );
}
