use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{Credential, UserId, UserProfile};
use storage::Storage;

use crate::error::Result;

const ACCESS_TOKEN: &str = "auth.access_token";
const REFRESH_TOKEN: &str = "auth.refresh_token";
const EXPIRES_AT: &str = "auth.expires_at";
const SUBJECT_USER_ID: &str = "auth.subject_user_id";
const PROFILE_USER_ID: &str = "profile.user_id";
const PROFILE_DISPLAY_NAME: &str = "profile.display_name";
const PROFILE_EMAIL: &str = "profile.email";
const PROFILE_AVATAR_URL: &str = "profile.avatar_url";

/// Durable persistence for the signed-in credential and the cached profile.
///
/// The token manager is the only writer.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self) -> Result<Option<Credential>>;
    async fn save_credential(&self, credential: &Credential) -> Result<()>;
    async fn load_profile(&self) -> Result<Option<UserProfile>>;
    async fn save_profile(&self, profile: &UserProfile) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Keeps credentials as key-value rows next to the local cache.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    storage: Storage,
}

impl SqliteCredentialStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        let entries = self.storage.load_credential_entries().await?;
        Ok(credential_from_entries(&entries))
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        let expires_at = credential.expires_at.map(|at| at.to_rfc3339());
        self.storage
            .write_credential_entries(&[
                (ACCESS_TOKEN, Some(credential.access_token.as_str())),
                (REFRESH_TOKEN, credential.refresh_token.as_deref()),
                (EXPIRES_AT, expires_at.as_deref()),
                (SUBJECT_USER_ID, Some(credential.subject_user_id.as_str())),
            ])
            .await?;
        Ok(())
    }

    async fn load_profile(&self) -> Result<Option<UserProfile>> {
        let entries = self.storage.load_credential_entries().await?;
        Ok(profile_from_entries(&entries))
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        self.storage
            .write_credential_entries(&[
                (PROFILE_USER_ID, Some(profile.user_id.as_str())),
                (PROFILE_DISPLAY_NAME, Some(profile.display_name.as_str())),
                (PROFILE_EMAIL, profile.email.as_deref()),
                (PROFILE_AVATAR_URL, profile.avatar_url.as_deref()),
            ])
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear_credential_entries().await?;
        Ok(())
    }
}

fn credential_from_entries(entries: &HashMap<String, String>) -> Option<Credential> {
    let access_token = entries.get(ACCESS_TOKEN)?.clone();
    let subject_user_id = UserId(entries.get(SUBJECT_USER_ID)?.clone());
    // An unreadable expiry is kept as `None`, which forces a refresh on next use.
    let expires_at = entries
        .get(EXPIRES_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc));

    Some(Credential {
        access_token,
        refresh_token: entries.get(REFRESH_TOKEN).cloned(),
        expires_at,
        subject_user_id,
    })
}

fn profile_from_entries(entries: &HashMap<String, String>) -> Option<UserProfile> {
    Some(UserProfile {
        user_id: UserId(entries.get(PROFILE_USER_ID)?.clone()),
        display_name: entries.get(PROFILE_DISPLAY_NAME).cloned().unwrap_or_default(),
        email: entries.get(PROFILE_EMAIL).cloned(),
        avatar_url: entries.get(PROFILE_AVATAR_URL).cloned(),
    })
}
