use std::sync::{Arc, Weak};

use chrono::Utc;
use shared::{
    domain::{
        ConversationSummary, Credential, Message, MessageId, ReadState, UserId, UserProfile,
    },
    protocol::SocialProvider,
};
use storage::Storage;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod feed;
pub mod mapping;
pub mod sync;
pub mod token_manager;
pub mod transport;

pub use api::{AuthApi, ChatApi};
pub use config::{load_settings, ClientSettings};
pub use credentials::{CredentialStore, SqliteCredentialStore};
pub use error::{ClientError, Result};
pub use feed::{FeedEvent, FeedSubscription, RoomFeed, WsRoomFeed};
pub use sync::{SyncEngine, SyncEvent, SyncState};
pub use token_manager::{SessionEvent, TokenManager, TokenRefresher};
pub use transport::{ApiRequest, ApiResponse, AuthorizingTransport, HttpExecutor, ReqwestExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConversationChanged { partner_id: UserId },
    SessionExpired,
}

pub struct ChatClient {
    settings: ClientSettings,
    cache: Storage,
    tokens: Arc<TokenManager>,
    auth: Arc<AuthApi>,
    api: ChatApi,
    sync: Arc<SyncEngine>,
    events: broadcast::Sender<ClientEvent>,
    logout_lock: Mutex<()>,
    background: Vec<JoinHandle<()>>,
}

impl ChatClient {
    pub async fn connect(settings: ClientSettings) -> Result<Arc<Self>> {
        let cache = Storage::new(&settings.database_url).await?;
        let executor = Arc::new(ReqwestExecutor::new(
            settings.api_base_url.clone(),
            settings.request_timeout(),
        )?);
        let feed_url = settings.resolved_feed_url();
        let buffer = settings.feed_buffer;
        Self::assemble(settings, cache, executor, move |tokens| -> Arc<dyn RoomFeed> {
            Arc::new(WsRoomFeed::new(feed_url, tokens, buffer))
        })
        .await
    }

    pub async fn assemble(
        settings: ClientSettings,
        cache: Storage,
        executor: Arc<dyn HttpExecutor>,
        feed_factory: impl FnOnce(Arc<TokenManager>) -> Arc<dyn RoomFeed>,
    ) -> Result<Arc<Self>> {
        let auth = Arc::new(AuthApi::new(executor.clone()));
        let store = Arc::new(SqliteCredentialStore::new(cache.clone()));
        let tokens =
            TokenManager::initialize(store, auth.clone(), settings.refresh_margin()).await?;
        let api = ChatApi::new(AuthorizingTransport::new(executor, tokens.clone()));
        let sync = SyncEngine::new(feed_factory(tokens.clone()), cache.clone());
        let (events, _) = broadcast::channel(1024);

        let identity_task = sync.spawn_identity_listener(tokens.subscribe_identity());
        let session_events = tokens.subscribe_session_events();

        Ok(Arc::new_cyclic(|weak| {
            let session_task = spawn_session_watcher(weak.clone(), session_events);
            Self {
                settings,
                cache,
                tokens,
                auth,
                api,
                sync,
                events,
                logout_lock: Mutex::new(()),
                background: vec![identity_task, session_task],
            }
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<Option<UserId>> {
        self.tokens.subscribe_identity()
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.tokens.subscribe_session_events()
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.tokens.current_user().await
    }

    pub async fn profile(&self) -> Result<Option<UserProfile>> {
        self.tokens.cached_profile().await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile> {
        let signed_in = self.auth.login(email, password).await;
        self.complete_sign_in(signed_in).await
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<UserProfile> {
        let signed_in = self.auth.register(email, password, display_name).await;
        self.complete_sign_in(signed_in).await
    }

    pub async fn social_sign_in(
        &self,
        provider: SocialProvider,
        id_token: &str,
    ) -> Result<UserProfile> {
        let signed_in = self.auth.social_sign_in(provider, id_token).await;
        self.complete_sign_in(signed_in).await
    }

    pub async fn logout(&self) -> Result<()> {
        let _guard = self.logout_lock.lock().await;
        self.sync.detach().await;
        self.tokens.clear().await?;
        self.cache.clear_all().await?;
        info!("signed out");
        Ok(())
    }

    /// Sends `body` to `partner_id`. The message is cached before the remote call so it is
    /// visible immediately; the conversation summary is updated once the server accepted it.
    pub async fn send_message(&self, partner_id: &UserId, body: &str) -> Result<Message> {
        let me = self.require_user().await?;
        let message = Message {
            id: MessageId::generate(),
            sender_id: me.clone(),
            receiver_id: partner_id.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
            read_state: ReadState::Sent,
        };
        self.cache.upsert_message(&message).await?;

        let sent = self.api.send_message(&message).await;
        self.guard(sent).await?;

        self.cache.record_conversation_activity(&me, &message).await?;
        self.sync.republish_current().await;
        self.notify_conversation_changed(partner_id);
        Ok(message)
    }

    pub async fn sync_conversation(&self, partner_id: &UserId) -> Result<Vec<Message>> {
        let me = self.require_user().await?;
        let fetched = self.api.fetch_conversation(partner_id, None).await;
        let messages = self.guard(fetched).await?;
        self.cache.upsert_messages(&messages).await?;

        let conversation = self.cache.query_conversation(&me, partner_id).await?;
        if let Some(newest) = conversation.last() {
            if self.cache.record_conversation_activity(&me, newest).await? {
                self.sync.republish_current().await;
            }
        }
        self.notify_conversation_changed(partner_id);
        Ok(conversation)
    }

    pub async fn sync_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let me = self.require_user().await?;
        let fetched = self.api.fetch_conversations(&me).await;
        let summaries = self.guard(fetched).await?;
        for summary in &summaries {
            self.cache.upsert_conversation_summary(&me, summary).await?;
        }
        self.sync.republish_current().await;
        Ok(self.cache.query_conversation_summaries(&me).await?)
    }

    pub async fn conversation(&self, partner_id: &UserId) -> Result<Vec<Message>> {
        let me = self.require_user().await?;
        Ok(self.cache.query_conversation(&me, partner_id).await?)
    }

    pub async fn summaries(&self) -> Result<Vec<ConversationSummary>> {
        let me = self.require_user().await?;
        Ok(self.cache.query_conversation_summaries(&me).await?)
    }

    /// Marks everything `partner_id` sent as read, locally first, then on the server.
    pub async fn mark_read(&self, partner_id: &UserId) -> Result<u64> {
        let me = self.require_user().await?;
        let changed = self.cache.mark_read(&me, partner_id).await?;
        let remote = self.api.mark_read(partner_id).await;
        self.guard(remote).await?;
        if changed > 0 {
            self.sync.republish_current().await;
            self.notify_conversation_changed(partner_id);
        }
        Ok(changed)
    }

    pub async fn delete_conversation(&self, partner_id: &UserId) -> Result<u64> {
        let me = self.require_user().await?;
        let remote = self.api.delete_conversation(partner_id).await;
        self.guard(remote).await?;
        let removed = self.cache.delete_conversation(&me, partner_id).await?;
        self.sync.republish_current().await;
        self.notify_conversation_changed(partner_id);
        Ok(removed)
    }

    pub async fn fetch_profile(&self) -> Result<UserProfile> {
        self.require_user().await?;
        let fetched = self.api.fetch_profile().await;
        self.guard(fetched).await
    }

    async fn complete_sign_in(
        &self,
        signed_in: Result<(Credential, UserProfile)>,
    ) -> Result<UserProfile> {
        let (credential, profile) = signed_in?;
        let user_id = credential.subject_user_id.clone();
        self.tokens.install(credential, Some(&profile)).await?;
        info!(user_id = %user_id, "signed in");

        if let Err(err) = self.sync.on_identity_changed(Some(user_id.clone())).await {
            warn!(user_id = %user_id, error = %err, "realtime sync not attached after sign-in");
        }
        Ok(profile)
    }

    pub async fn force_logout(&self) {
        let _guard = self.logout_lock.lock().await;
        if self.tokens.current_user().await.is_none() {
            return;
        }

        warn!("session expired; forcing logout");
        self.sync.detach().await;
        if let Err(err) = self.tokens.clear().await {
            error!(error = %err, "failed to clear credentials after session expiry");
        }
        if let Err(err) = self.cache.clear_all().await {
            error!(error = %err, "failed to clear local cache after session expiry");
        }
        let _ = self.events.send(ClientEvent::SessionExpired);
    }

    async fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_session_expired() {
                self.force_logout().await;
            }
        }
        result
    }

    async fn require_user(&self) -> Result<UserId> {
        self.tokens
            .current_user()
            .await
            .ok_or(ClientError::NotSignedIn)
    }

    fn notify_conversation_changed(&self, partner_id: &UserId) {
        let _ = self.events.send(ClientEvent::ConversationChanged {
            partner_id: partner_id.clone(),
        });
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

fn spawn_session_watcher(
    client: Weak<ChatClient>,
    mut session_events: broadcast::Receiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match session_events.recv().await {
                Ok(SessionEvent::Expired) => {
                    let Some(client) = client.upgrade() else {
                        break;
                    };
                    client.force_logout().await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session watcher lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
