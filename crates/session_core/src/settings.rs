use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::ChannelError;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub api_url: String,
    pub ws_url: Option<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub unread_poll_secs: u64,
    pub unread_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api".into(),
            ws_url: None,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 5_000,
            unread_poll_secs: 30,
            unread_path: "/chat/unread-count".into(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn unread_poll_interval(&self) -> Duration {
        Duration::from_secs(self.unread_poll_secs.max(1))
    }

    /// Explicit `ws_url`, or the API url with its scheme swapped and `/ws/chat` appended.
    pub fn realtime_url(&self) -> Result<Url, ChannelError> {
        if let Some(ws_url) = &self.ws_url {
            return Url::parse(ws_url).map_err(|err| ChannelError::InvalidUrl(err.to_string()));
        }
        derive_ws_url(&self.api_url)
    }
}

pub fn derive_ws_url(api_url: &str) -> Result<Url, ChannelError> {
    let ws_url = if api_url.starts_with("https://") {
        api_url.replacen("https://", "wss://", 1)
    } else if api_url.starts_with("http://") {
        api_url.replacen("http://", "ws://", 1)
    } else {
        return Err(ChannelError::InvalidUrl(
            "api_url must start with http:// or https://".into(),
        ));
    };
    let ws_url = format!("{}/ws/chat", ws_url.trim_end_matches('/'));
    Url::parse(&ws_url).map_err(|err| ChannelError::InvalidUrl(err.to_string()))
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            for (key, value) in file_cfg {
                let value = match value {
                    toml::Value::String(v) => v,
                    other => other.to_string(),
                };
                apply(&mut settings, &key, value);
            }
        }
    }

    if let Ok(v) = std::env::var("ESG_API_URL") {
        settings.api_url = v;
    }
    for key in [
        "api_url",
        "ws_url",
        "request_timeout_ms",
        "connect_timeout_ms",
        "reconnect_initial_ms",
        "reconnect_max_ms",
        "unread_poll_secs",
        "unread_path",
    ] {
        if let Ok(v) = std::env::var(format!("APP__{}", key.to_ascii_uppercase())) {
            apply(&mut settings, key, v);
        }
    }

    settings
}

fn apply(settings: &mut ClientSettings, key: &str, value: String) {
    match key {
        "api_url" => settings.api_url = value,
        "ws_url" => settings.ws_url = Some(value),
        "unread_path" => settings.unread_path = value,
        "request_timeout_ms" => set_number(&mut settings.request_timeout_ms, &value),
        "connect_timeout_ms" => set_number(&mut settings.connect_timeout_ms, &value),
        "reconnect_initial_ms" => set_number(&mut settings.reconnect_initial_ms, &value),
        "reconnect_max_ms" => set_number(&mut settings.reconnect_max_ms, &value),
        "unread_poll_secs" => set_number(&mut settings.unread_poll_secs, &value),
        _ => {}
    }
}

fn set_number(slot: &mut u64, value: &str) {
    if let Ok(parsed) = value.trim().parse::<u64>() {
        *slot = parsed;
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
