use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::{ConversationSummary, Credential, Message, ReadState, RoomKey, UserId, UserProfile},
    protocol::{
        AuthResponse, ConversationPayload, MessagePayload, RoomNode, RoomUser, SendMessageRequest,
        TokenResponse,
    },
};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDelta {
    pub room_key: RoomKey,
    pub last_message: String,
    pub last_timestamp_ms: i64,
    pub users: HashMap<String, RoomUser>,
}

pub fn room_key_for(a: &UserId, b: &UserId) -> RoomKey {
    RoomKey::for_pair(a, b)
}

/// Removes `current_user` from a two-party room key. Rooms the user is not part of yield `None`.
pub fn partner_from_room_key(room_key: &RoomKey, current_user: &UserId) -> Option<UserId> {
    room_key.partner_of(current_user)
}

pub fn parse_room_node(key: &str, node: &Value) -> Result<RoomDelta> {
    let room_key = RoomKey::new(key);
    if !room_key.is_pair_shaped() {
        return Err(ClientError::MalformedRemoteData(format!(
            "room key '{key}' does not name two participants"
        )));
    }

    let node = RoomNode::deserialize(node)
        .map_err(|err| ClientError::MalformedRemoteData(format!("room '{key}': {err}")))?;
    Ok(RoomDelta {
        room_key,
        last_message: node.last_message,
        last_timestamp_ms: node.last_timestamp,
        users: node.users,
    })
}

pub fn summary_from_delta(
    delta: &RoomDelta,
    partner_id: &UserId,
    now: DateTime<Utc>,
) -> ConversationSummary {
    let partner = delta.users.get(partner_id.as_str());
    let display_name = partner
        .and_then(|user| user.name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| partner_id.to_string());

    ConversationSummary {
        room_key: delta.room_key.clone(),
        partner_id: partner_id.clone(),
        partner_display_name: display_name,
        partner_avatar_url: partner.and_then(|user| user.avatar.clone()),
        last_message_text: delta.last_message.clone(),
        last_message_at: datetime_from_millis(delta.last_timestamp_ms),
        unread_count: 0,
        updated_at: now,
    }
}

pub fn summary_from_conversation_payload(
    payload: &ConversationPayload,
    current_user: &UserId,
    now: DateTime<Utc>,
) -> ConversationSummary {
    ConversationSummary {
        room_key: room_key_for(current_user, &payload.partner_id),
        partner_id: payload.partner_id.clone(),
        partner_display_name: payload.partner_name.clone(),
        partner_avatar_url: payload.partner_avatar.clone(),
        last_message_text: payload.last_message.clone(),
        last_message_at: datetime_from_millis(payload.last_timestamp),
        unread_count: 0,
        updated_at: now,
    }
}

pub fn message_from_payload(payload: MessagePayload) -> Message {
    Message {
        id: payload.id,
        sender_id: payload.sender_id,
        receiver_id: payload.receiver_id,
        body: payload.body,
        created_at: datetime_from_millis(payload.created_at_ms),
        read_state: if payload.read {
            ReadState::Read
        } else {
            ReadState::Sent
        },
    }
}

pub fn payload_from_message(message: &Message) -> MessagePayload {
    MessagePayload {
        id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        receiver_id: message.receiver_id.clone(),
        body: message.body.clone(),
        created_at_ms: millis_from_datetime(message.created_at),
        read: message.read_state == ReadState::Read,
    }
}

pub fn send_request_from_message(message: &Message) -> SendMessageRequest {
    SendMessageRequest {
        id: message.id.clone(),
        receiver_id: message.receiver_id.clone(),
        body: message.body.clone(),
        created_at_ms: millis_from_datetime(message.created_at),
    }
}

/// Builds a credential from a refresh response. Servers that do not rotate refresh tokens
/// omit the field, in which case the previous one stays in use.
pub fn credential_from_tokens(
    tokens: TokenResponse,
    subject_user_id: UserId,
    previous_refresh_token: Option<String>,
    now: DateTime<Utc>,
) -> Credential {
    Credential {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token.or(previous_refresh_token),
        // Out-of-range lifetimes leave no expiry, which reads as already expired.
        expires_at: tokens
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime)),
        subject_user_id,
    }
}

pub fn credential_from_auth(
    response: AuthResponse,
    now: DateTime<Utc>,
) -> (Credential, UserProfile) {
    let credential =
        credential_from_tokens(response.tokens, response.user.user_id.clone(), None, now);
    (credential, response.user)
}

pub fn datetime_from_millis(ms: i64) -> DateTime<Utc> {
    storage::datetime_from_millis(ms)
}

pub fn millis_from_datetime(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}
