use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(RoomKey);

/// Separator between the two participant ids of a [`RoomKey`].
pub const ROOM_KEY_SEPARATOR: char = '_';

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl RoomKey {
    /// Builds the composite key for a two-party room. Participant order does not matter.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{ROOM_KEY_SEPARATOR}{second}"))
    }

    pub fn is_pair_shaped(&self) -> bool {
        self.0.char_indices().any(|(at, c)| {
            c == ROOM_KEY_SEPARATOR && at > 0 && at + c.len_utf8() < self.0.len()
        })
    }

    /// The other participant of a room that `member` belongs to. Ids may themselves
    /// contain the separator, so the split is resolved relative to `member`: a candidate
    /// only counts if it rebuilds this exact key.
    pub fn partner_of(&self, member: &UserId) -> Option<UserId> {
        let key = self.0.as_str();
        let member = member.as_str();
        let candidates = [
            key.strip_prefix(member)
                .and_then(|rest| rest.strip_prefix(ROOM_KEY_SEPARATOR)),
            key.strip_suffix(member)
                .and_then(|rest| rest.strip_suffix(ROOM_KEY_SEPARATOR)),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter(|partner| !partner.is_empty())
            .map(UserId::new)
            .find(|partner| Self::for_pair(&UserId::new(member), partner) == *self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    Sent,
    Read,
}

impl ReadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadState::Sent => "sent",
            ReadState::Read => "read",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "read" => ReadState::Read,
            _ => ReadState::Sent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read_state: ReadState,
}

impl Message {
    /// The other participant from `current_user`'s point of view.
    pub fn partner_of(&self, current_user: &UserId) -> &UserId {
        if &self.sender_id == current_user {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub room_key: RoomKey,
    pub partner_id: UserId,
    pub partner_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_avatar_url: Option<String>,
    pub last_message_text: String,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub subject_user_id: UserId,
}

impl Credential {
    /// True when the access token stays valid for at least `margin` past `now`.
    /// A credential without an expiry is never fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - margin > now,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}
