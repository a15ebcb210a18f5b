use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use shared::{domain::UserId, protocol::FeedFrame};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, Result},
    token_manager::TokenManager,
};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(Vec<(String, Value)>),
    Error(String),
}

/// Cancellable handle over one feed subscription. Dropping it stops delivery.
pub struct FeedSubscription {
    events: mpsc::Receiver<FeedEvent>,
    task: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<FeedEvent>) -> Self {
        Self { events, task: None }
    }

    pub fn with_task(events: mpsc::Receiver<FeedEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[async_trait]
pub trait RoomFeed: Send + Sync {
    async fn subscribe(&self, user_id: &UserId) -> Result<FeedSubscription>;
}

/// Websocket room feed. Frames are tagged JSON (`snapshot` / `error`).
pub struct WsRoomFeed {
    feed_url: String,
    tokens: Arc<TokenManager>,
    buffer: usize,
}

impl WsRoomFeed {
    pub fn new(feed_url: impl Into<String>, tokens: Arc<TokenManager>, buffer: usize) -> Self {
        Self {
            feed_url: feed_url.into(),
            tokens,
            buffer: buffer.max(1),
        }
    }

    fn subscription_url(&self, user_id: &UserId, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.feed_url).map_err(|err| {
            ClientError::Network(format!("invalid feed url '{}': {err}", self.feed_url))
        })?;
        url.query_pairs_mut()
            .append_pair("user_id", user_id.as_str())
            .append_pair("auth", token);
        Ok(url)
    }
}

#[async_trait]
impl RoomFeed for WsRoomFeed {
    async fn subscribe(&self, user_id: &UserId) -> Result<FeedSubscription> {
        let token = self.tokens.get_valid_token().await?;
        let url = self.subscription_url(user_id, &token)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!(user_id = %user_id, "room feed connected");

        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.buffer);
        let user_id = user_id.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => decode_frame(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = tx
                            .send(FeedEvent::Error(format!("room feed receive failed: {err}")))
                            .await;
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(user_id = %user_id, "room feed reader stopped");
        });

        Ok(FeedSubscription::with_task(rx, task))
    }
}

fn decode_frame(text: &str) -> FeedEvent {
    match serde_json::from_str::<FeedFrame>(text) {
        Ok(FeedFrame::Snapshot(rooms)) => FeedEvent::Snapshot(rooms.into_iter().collect()),
        Ok(FeedFrame::Error(payload)) => FeedEvent::Error(payload.message),
        Err(err) => {
            warn!(error = %err, "invalid room feed frame");
            FeedEvent::Error(format!("invalid room feed frame: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn snapshot_frames_keep_every_room() {
        let frame = json!({
            "type": "snapshot",
            "payload": {
                "u1_u2": { "lastMessage": "hi", "lastTimestamp": 1 },
                "u1_u3": { "lastMessage": "yo", "lastTimestamp": 2 }
            }
        });
        let FeedEvent::Snapshot(rooms) = decode_frame(&frame.to_string()) else {
            panic!("expected snapshot");
        };
        let mut keys: Vec<_> = rooms.iter().map(|(key, _)| key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["u1_u2", "u1_u3"]);
    }

    #[test]
    fn error_and_garbage_frames_become_error_events() {
        let frame = json!({ "type": "error", "payload": { "message": "permission denied" } });
        assert_eq!(
            decode_frame(&frame.to_string()),
            FeedEvent::Error("permission denied".into())
        );
        assert!(matches!(decode_frame("{not json"), FeedEvent::Error(_)));
    }

    #[tokio::test]
    async fn cancelled_subscription_yields_nothing_more() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = FeedSubscription::new(rx);
        tx.send(FeedEvent::Error("first".into())).await.expect("send");
        assert_eq!(subscription.next().await, Some(FeedEvent::Error("first".into())));

        subscription.cancel();
        assert!(tx.send(FeedEvent::Error("late".into())).await.is_err());
        assert_eq!(subscription.next().await, None);
    }
}
