use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Credential, UserId, UserProfile},
    protocol::TokenResponse,
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialStore,
    error::{ClientError, Result},
    mapping::credential_from_tokens,
};

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshTrigger {
    /// Refresh only if the cached token is still stale once the lock is held.
    Stale,
    Forced,
    /// The server rejected this token; refresh unless someone already replaced it.
    Rejected(String),
}

#[derive(Default)]
struct RefreshSlot {
    last_outcome: Option<Result<String>>,
}

/// Owns the credential lifecycle and hands out currently valid access tokens.
///
/// Reads of the cached credential are concurrent. Refreshes are serialized by a single
/// lock; callers that queue up behind an in-flight refresh receive its outcome instead
/// of starting another one.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    margin: chrono::Duration,
    cached: RwLock<Option<Credential>>,
    refresh_slot: Mutex<RefreshSlot>,
    refresh_generation: AtomicU64,
    identity: watch::Sender<Option<UserId>>,
    session_events: broadcast::Sender<SessionEvent>,
}

impl TokenManager {
    pub async fn initialize(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        margin: chrono::Duration,
    ) -> Result<Arc<Self>> {
        let credential = store.load_credential().await?;
        let (identity, _) =
            watch::channel(credential.as_ref().map(|c| c.subject_user_id.clone()));
        let (session_events, _) = broadcast::channel(64);
        if let Some(credential) = &credential {
            info!(user_id = %credential.subject_user_id, "restored persisted credential");
        }

        Ok(Arc::new(Self {
            store,
            refresher,
            margin,
            cached: RwLock::new(credential),
            refresh_slot: Mutex::new(RefreshSlot::default()),
            refresh_generation: AtomicU64::new(0),
            identity,
            session_events,
        }))
    }

    pub async fn get_valid_token(&self) -> Result<String> {
        if let Some(token) = self.fresh_cached_token().await {
            return Ok(token);
        }
        self.refresh_single_flight(RefreshTrigger::Stale).await
    }

    /// Refreshes regardless of the cached expiry, still through the single-flight lock.
    pub async fn force_refresh(&self) -> Result<String> {
        self.refresh_single_flight(RefreshTrigger::Forced).await
    }

    /// Used after the server rejected `rejected_token`. Concurrent rejections of the same
    /// token collapse into one refresh.
    pub async fn refresh_after_rejection(&self, rejected_token: &str) -> Result<String> {
        self.refresh_single_flight(RefreshTrigger::Rejected(rejected_token.to_string()))
            .await
    }

    pub async fn install(
        &self,
        credential: Credential,
        profile: Option<&UserProfile>,
    ) -> Result<()> {
        let mut slot = self.refresh_slot.lock().await;
        self.store.save_credential(&credential).await?;
        if let Some(profile) = profile {
            self.store.save_profile(profile).await?;
        }

        let user_id = credential.subject_user_id.clone();
        slot.last_outcome = Some(Ok(credential.access_token.clone()));
        *self.cached.write().await = Some(credential);
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        info!(user_id = %user_id, "credential installed");
        self.identity.send_replace(Some(user_id.clone()));
        let _ = self.session_events.send(SessionEvent::SignedIn(user_id));
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut slot = self.refresh_slot.lock().await;
        self.store.clear().await?;
        *self.cached.write().await = None;
        slot.last_outcome = None;
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        info!("credential cleared");
        self.identity.send_replace(None);
        let _ = self.session_events.send(SessionEvent::SignedOut);
        Ok(())
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|c| c.subject_user_id.clone())
    }

    pub async fn current_credential(&self) -> Option<Credential> {
        self.cached.read().await.clone()
    }

    pub async fn cached_profile(&self) -> Result<Option<UserProfile>> {
        self.store.load_profile().await
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<Option<UserId>> {
        self.identity.subscribe()
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    pub(crate) fn notify_session_expired(&self) {
        let _ = self.session_events.send(SessionEvent::Expired);
    }

    async fn fresh_cached_token(&self) -> Option<String> {
        let guard = self.cached.read().await;
        let credential = guard.as_ref()?;
        credential
            .is_fresh_at(Utc::now(), self.margin)
            .then(|| credential.access_token.clone())
    }

    async fn refresh_single_flight(&self, trigger: RefreshTrigger) -> Result<String> {
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let mut slot = self.refresh_slot.lock().await;

        if self.refresh_generation.load(Ordering::Acquire) != observed {
            if let Some(outcome) = slot.last_outcome.clone() {
                debug!("joined outcome of a refresh that completed while waiting");
                return outcome;
            }
        }

        match &trigger {
            RefreshTrigger::Stale => {
                if let Some(token) = self.fresh_cached_token().await {
                    return Ok(token);
                }
            }
            RefreshTrigger::Rejected(rejected) => {
                let current = self.cached.read().await.clone();
                if let Some(current) = current {
                    if &current.access_token != rejected
                        && current.is_fresh_at(Utc::now(), self.margin)
                    {
                        return Ok(current.access_token);
                    }
                }
            }
            RefreshTrigger::Forced => {}
        }

        let outcome = self.perform_refresh().await;
        slot.last_outcome = Some(outcome.clone());
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    async fn perform_refresh(&self) -> Result<String> {
        let Some(current) = self.cached.read().await.clone() else {
            debug!("refresh requested without a credential");
            return Err(ClientError::SessionExpired);
        };

        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!(user_id = %current.subject_user_id, "no refresh token available; session expired");
            self.notify_session_expired();
            return Err(ClientError::SessionExpired);
        };

        let response = match self.refresher.refresh(&refresh_token).await {
            Ok(response) => response,
            Err(err) => {
                warn!(user_id = %current.subject_user_id, error = %err, "token refresh failed; session expired");
                self.notify_session_expired();
                return Err(ClientError::SessionExpired);
            }
        };

        let renewed = credential_from_tokens(
            response,
            current.subject_user_id.clone(),
            Some(refresh_token),
            Utc::now(),
        );
        self.store.save_credential(&renewed).await?;

        let token = renewed.access_token.clone();
        info!(user_id = %renewed.subject_user_id, expires_at = ?renewed.expires_at, "access token refreshed");
        *self.cached.write().await = Some(renewed);
        Ok(token)
    }
}

#[cfg(test)]
#[path = "tests/token_manager_tests.rs"]
mod tests;
