use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use chrono::Utc;
use serde_json::Value;
use shared::domain::{ConversationSummary, RoomKey, UserId};
use storage::Storage;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    feed::{FeedEvent, FeedSubscription, RoomFeed},
    mapping::{parse_room_node, partner_from_room_key, summary_from_delta},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Attaching,
    Active,
    Detaching,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    SummariesUpdated {
        user_id: UserId,
        summaries: Vec<ConversationSummary>,
    },
    FeedError {
        user_id: UserId,
        message: String,
    },
    CacheError {
        user_id: UserId,
        error: ClientError,
    },
}

/// Last `(text, timestamp)` seen per room during one attachment.
#[derive(Debug, Default)]
pub struct DedupeWindow {
    seen: HashMap<RoomKey, (String, i64)>,
}

impl DedupeWindow {
    pub fn observe(&mut self, room_key: &RoomKey, text: &str, timestamp_ms: i64) -> bool {
        if let Some((seen_text, seen_ts)) = self.seen.get(room_key) {
            if seen_text == text && *seen_ts == timestamp_ms {
                return false;
            }
        }
        self.seen
            .insert(room_key.clone(), (text.to_string(), timestamp_ms));
        true
    }

    pub fn forget(&mut self, room_key: &RoomKey) {
        self.seen.remove(room_key);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

struct Attachment {
    user_id: UserId,
    epoch: u64,
    dedupe: DedupeWindow,
    worker: Option<JoinHandle<()>>,
}

struct SyncInner {
    state: SyncState,
    epoch: u64,
    attachment: Option<Attachment>,
    latest: Vec<ConversationSummary>,
}

pub struct SyncEngine {
    feed: Arc<dyn RoomFeed>,
    cache: Storage,
    inner: Mutex<SyncInner>,
    // Serializes attach/detach/retry so at most one subscription is ever live.
    transitions: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(feed: Arc<dyn RoomFeed>, cache: Storage) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            feed,
            cache,
            inner: Mutex::new(SyncInner {
                state: SyncState::Idle,
                epoch: 0,
                attachment: None,
                latest: Vec::new(),
            }),
            transitions: Mutex::new(()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SyncState {
        self.inner.lock().await.state
    }

    pub async fn active_user(&self) -> Option<UserId> {
        self.inner
            .lock()
            .await
            .attachment
            .as_ref()
            .map(|a| a.user_id.clone())
    }

    pub async fn latest_summaries(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.latest.clone()
    }

    pub async fn dedupe_len(&self) -> usize {
        self.inner
            .lock()
            .await
            .attachment
            .as_ref()
            .map_or(0, |a| a.dedupe.len())
    }

    /// Subscribes the feed for `user_id`, tearing down any existing attachment first.
    ///
    /// A failed subscription is reported as a `FeedError` and returned; the engine stays
    /// attached so [`SyncEngine::retry`] can reconnect.
    pub async fn attach(self: &Arc<Self>, user_id: UserId) -> Result<()> {
        let _transition = self.transitions.lock().await;
        self.detach_locked().await;
        self.attach_locked(user_id).await
    }

    pub async fn detach(&self) {
        let _transition = self.transitions.lock().await;
        self.detach_locked().await;
    }

    pub async fn retry(self: &Arc<Self>) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let Some(user_id) = self.active_user().await else {
            return Ok(());
        };
        self.detach_locked().await;
        self.attach_locked(user_id).await
    }

    /// Follows the signed-in identity: a new user re-attaches, sign-out detaches.
    pub async fn on_identity_changed(self: &Arc<Self>, user_id: Option<UserId>) -> Result<()> {
        let _transition = self.transitions.lock().await;
        match user_id {
            Some(user_id) => {
                if self.active_user().await.as_ref() == Some(&user_id) {
                    return Ok(());
                }
                self.detach_locked().await;
                self.attach_locked(user_id).await
            }
            None => {
                self.detach_locked().await;
                Ok(())
            }
        }
    }

    pub fn spawn_identity_listener(
        self: &Arc<Self>,
        mut identity: watch::Receiver<Option<UserId>>,
    ) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let current = identity.borrow_and_update().clone();
                let Some(strong) = engine.upgrade() else {
                    break;
                };
                if let Err(err) = strong.on_identity_changed(current).await {
                    warn!(error = %err, "sync attach after identity change failed");
                }
                drop(strong);
                if identity.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn republish_current(&self) {
        let mut inner = self.inner.lock().await;
        let Some(user_id) = inner.attachment.as_ref().map(|a| a.user_id.clone()) else {
            return;
        };
        self.republish_locked(&mut inner, &user_id).await;
    }

    async fn attach_locked(self: &Arc<Self>, user_id: UserId) -> Result<()> {
        self.set_state(SyncState::Attaching).await;
        info!(user_id = %user_id, "attaching realtime sync");

        let subscription = self.feed.subscribe(&user_id).await;

        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        let epoch = inner.epoch;
        let (worker, outcome) = match subscription {
            Ok(subscription) => (Some(self.spawn_worker(epoch, subscription)), Ok(())),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "room feed subscription failed");
                let _ = self.events.send(SyncEvent::FeedError {
                    user_id: user_id.clone(),
                    message: err.to_string(),
                });
                (None, Err(err))
            }
        };
        inner.attachment = Some(Attachment {
            user_id: user_id.clone(),
            epoch,
            dedupe: DedupeWindow::default(),
            worker,
        });
        inner.state = SyncState::Active;
        let _ = self
            .events
            .send(SyncEvent::StateChanged(SyncState::Active));
        self.republish_locked(&mut inner, &user_id).await;
        outcome
    }

    async fn detach_locked(&self) {
        let worker = {
            let mut inner = self.inner.lock().await;
            let Some(attachment) = inner.attachment.take() else {
                return;
            };
            inner.state = SyncState::Detaching;
            let _ = self
                .events
                .send(SyncEvent::StateChanged(SyncState::Detaching));
            info!(user_id = %attachment.user_id, epoch = attachment.epoch, "detaching realtime sync");
            attachment.worker
        };

        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }

        let mut inner = self.inner.lock().await;
        inner.latest.clear();
        inner.state = SyncState::Idle;
        let _ = self.events.send(SyncEvent::StateChanged(SyncState::Idle));
    }

    fn spawn_worker(
        self: &Arc<Self>,
        epoch: u64,
        mut subscription: FeedSubscription,
    ) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut failed = false;
            while let Some(event) = subscription.next().await {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                match event {
                    FeedEvent::Snapshot(rooms) => {
                        failed = false;
                        engine.apply_snapshot(epoch, rooms).await;
                    }
                    FeedEvent::Error(message) => {
                        failed = true;
                        engine.report_feed_error(epoch, message).await;
                    }
                }
            }
            // The subscription ended on its own; an error already reported covers it.
            if !failed {
                if let Some(engine) = engine.upgrade() {
                    engine
                        .report_feed_error(epoch, "room feed closed".to_string())
                        .await;
                }
            }
            debug!(epoch, "sync worker finished");
        })
    }

    async fn apply_snapshot(&self, epoch: u64, rooms: Vec<(String, Value)>) {
        let mut inner = self.inner.lock().await;
        let Some(attachment) = inner
            .attachment
            .as_mut()
            .filter(|attachment| attachment.epoch == epoch)
        else {
            debug!(epoch, "dropping snapshot from a detached subscription");
            return;
        };

        let user_id = attachment.user_id.clone();
        let now = Utc::now();
        let mut changed = false;
        for (key, node) in rooms {
            let delta = match parse_room_node(&key, &node) {
                Ok(delta) => delta,
                Err(err) => {
                    warn!(room_key = %key, error = %err, "skipping malformed room");
                    continue;
                }
            };
            let Some(partner_id) = partner_from_room_key(&delta.room_key, &user_id) else {
                debug!(room_key = %key, "ignoring room without the current user");
                continue;
            };
            if !attachment
                .dedupe
                .observe(&delta.room_key, &delta.last_message, delta.last_timestamp_ms)
            {
                continue;
            }

            let summary = summary_from_delta(&delta, &partner_id, now);
            match self.cache.upsert_conversation_summary(&user_id, &summary).await {
                Ok(true) => changed = true,
                Ok(false) => {
                    debug!(room_key = %key, "cached summary is newer than delta");
                }
                Err(err) => {
                    warn!(room_key = %key, error = %err, "failed to cache room summary");
                    attachment.dedupe.forget(&delta.room_key);
                    let _ = self.events.send(SyncEvent::CacheError {
                        user_id: user_id.clone(),
                        error: err.into(),
                    });
                }
            }
        }

        if changed {
            self.republish_locked(&mut inner, &user_id).await;
        }
    }

    async fn report_feed_error(&self, epoch: u64, message: String) {
        let inner = self.inner.lock().await;
        let Some(attachment) = inner
            .attachment
            .as_ref()
            .filter(|attachment| attachment.epoch == epoch)
        else {
            return;
        };
        warn!(user_id = %attachment.user_id, error = %message, "room feed reported an error");
        let _ = self.events.send(SyncEvent::FeedError {
            user_id: attachment.user_id.clone(),
            message,
        });
    }

    async fn republish_locked(&self, inner: &mut SyncInner, user_id: &UserId) {
        match self.cache.query_conversation_summaries(user_id).await {
            Ok(summaries) => {
                inner.latest = summaries.clone();
                let _ = self.events.send(SyncEvent::SummariesUpdated {
                    user_id: user_id.clone(),
                    summaries,
                });
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "failed to load conversation summaries");
                let _ = self.events.send(SyncEvent::CacheError {
                    user_id: user_id.clone(),
                    error: err.into(),
                });
            }
        }
    }

    async fn set_state(&self, state: SyncState) {
        self.inner.lock().await.state = state;
        let _ = self.events.send(SyncEvent::StateChanged(state));
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
