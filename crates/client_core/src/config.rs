use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Realtime feed endpoint. Derived from `api_base_url` when unset.
    pub feed_url: Option<String>,
    pub database_url: String,
    pub token_refresh_margin_secs: i64,
    pub request_timeout_secs: u64,
    pub feed_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8443".into(),
            feed_url: None,
            database_url: "sqlite://./data/chat_cache.db".into(),
            token_refresh_margin_secs: 60,
            request_timeout_secs: 30,
            feed_buffer: 64,
        }
    }
}

impl ClientSettings {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs.max(0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn resolved_feed_url(&self) -> String {
        if let Some(url) = &self.feed_url {
            return url.clone();
        }

        let base = self.api_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/rooms/ws")
    }
}

/// Loads `client.toml` from the working directory when present, then applies `APP__*`
/// environment overrides.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ClientSettings> {
    let mut settings = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        toml::from_str::<ClientSettings>(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?
    } else {
        ClientSettings::default()
    };

    apply_env_overrides(&mut settings, env)?;
    Ok(settings)
}

fn apply_env_overrides(
    settings: &mut ClientSettings,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__FEED_URL") {
        settings.feed_url = Some(v);
    }
    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__TOKEN_REFRESH_MARGIN_SECS") {
        settings.token_refresh_margin_secs = v
            .parse()
            .with_context(|| format!("APP__TOKEN_REFRESH_MARGIN_SECS is not an integer: {v}"))?;
    }
    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v
            .parse()
            .with_context(|| format!("APP__REQUEST_TIMEOUT_SECS is not an integer: {v}"))?;
    }
    if let Some(v) = env("APP__FEED_BUFFER") {
        settings.feed_buffer = v
            .parse()
            .with_context(|| format!("APP__FEED_BUFFER is not an integer: {v}"))?;
    }
    Ok(())
}
