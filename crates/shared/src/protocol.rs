use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId, UserProfile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialProvider {
    Google,
    Facebook,
    Apple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialSignInRequest {
    pub provider: SocialProvider,
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Token triple returned by the refresh endpoint. `expires_in` is in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

/// Login, registration and social sign-in all answer with tokens plus the signed-in profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenResponse,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at_ms: i64,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub id: MessageId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub partner_id: UserId,
    pub partner_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_avatar: Option<String>,
    pub last_message: String,
    pub last_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

/// Display fields for one participant inside a room node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// A single node of the realtime `rooms` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomNode {
    pub last_message: String,
    pub last_timestamp: i64,
    #[serde(default)]
    pub users: HashMap<String, RoomUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedErrorPayload {
    pub message: String,
}

/// Frames pushed by the realtime feed. A snapshot carries every room visible to the
/// subscriber keyed by room key; nodes stay untyped so one bad node can be skipped alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedFrame {
    Snapshot(serde_json::Map<String, serde_json::Value>),
    Error(FeedErrorPayload),
}
