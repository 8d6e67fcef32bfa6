use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatClientConfig {
    pub api_base_url: String,
    pub hub_url: String,
    pub page_size: u32,
    pub typing_idle: Duration,
    pub peer_typing_timeout: Duration,
    /// Delay before each automatic reconnect attempt; empty disables reconnect.
    pub reconnect_delays: Vec<Duration>,
    /// Polling period used only while no push connection is available.
    pub poll_interval: Option<Duration>,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            hub_url: "ws://127.0.0.1:5000/hubs/chat".into(),
            page_size: 20,
            typing_idle: Duration::from_millis(2000),
            peer_typing_timeout: Duration::from_millis(2500),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            poll_interval: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api_base_url: Option<String>,
    hub_url: Option<String>,
    page_size: Option<u32>,
    typing_idle_ms: Option<u64>,
    peer_typing_timeout_ms: Option<u64>,
    reconnect_delays_ms: Option<Vec<u64>>,
    poll_interval_ms: Option<u64>,
}

/// Defaults, then the TOML file (when it exists), then environment overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ChatClientConfig> {
    let mut config = ChatClientConfig::default();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        apply_file_config(&mut config, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_file_config(config: &mut ChatClientConfig, raw: &str) -> anyhow::Result<()> {
    let file: FileConfig = toml::from_str(raw)?;
    if let Some(v) = file.api_base_url {
        config.api_base_url = v;
    }
    if let Some(v) = file.hub_url {
        config.hub_url = v;
    }
    if let Some(v) = file.page_size {
        config.page_size = v.max(1);
    }
    if let Some(v) = file.typing_idle_ms {
        config.typing_idle = Duration::from_millis(v);
    }
    if let Some(v) = file.peer_typing_timeout_ms {
        config.peer_typing_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file.reconnect_delays_ms {
        config.reconnect_delays = v.into_iter().map(Duration::from_millis).collect();
    }
    if let Some(v) = file.poll_interval_ms {
        config.poll_interval = poll_interval_from_ms(v);
    }
    Ok(())
}

fn apply_env_overrides(config: &mut ChatClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_API_URL") {
        config.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        config.api_base_url = v;
    }

    if let Some(v) = lookup("CHAT_HUB_URL") {
        config.hub_url = v;
    }
    if let Some(v) = lookup("APP__HUB_URL") {
        config.hub_url = v;
    }

    if let Some(v) = lookup("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            config.page_size = parsed.max(1);
        }
    }
    if let Some(v) = lookup("APP__TYPING_IDLE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.typing_idle = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = lookup("APP__PEER_TYPING_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.peer_typing_timeout = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = lookup("APP__POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.poll_interval = poll_interval_from_ms(parsed);
        }
    }
    if let Some(v) = lookup("APP__RECONNECT_DELAYS_MS") {
        let parsed: Result<Vec<u64>, _> = v
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<u64>)
            .collect();
        if let Ok(delays) = parsed {
            config.reconnect_delays = delays.into_iter().map(Duration::from_millis).collect();
        }
    }
}

fn poll_interval_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
