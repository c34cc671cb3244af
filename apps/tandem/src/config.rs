use std::env;
#[cfg(test)]
use std::sync::Mutex;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

/// Tandem configuration, read from the environment. CLI flags override it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the chat relay (defaults to "ws://127.0.0.1:8000")
    pub relay_url: String,
    /// STUN/TURN URLs handed to the peer connection
    pub ice_servers: Vec<String>,
    /// Cap on remote candidates buffered before a remote description exists
    pub max_pending_candidates: usize,
    /// Accept incoming offers without a local `/call`
    pub auto_answer: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = env::var("TANDEM_RELAY_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.relay_url);
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let relay_url = relay_url.replacen("://localhost", "://127.0.0.1", 1);

        let ice_servers = if env_truthy("TANDEM_LOCALHOST_ONLY").unwrap_or(false) {
            Vec::new()
        } else {
            match env::var("TANDEM_ICE_SERVERS") {
                Ok(list) => parse_list(&list),
                Err(_) => defaults.ice_servers,
            }
        };

        let max_pending_candidates = env::var("TANDEM_MAX_PENDING_CANDIDATES")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|cap: &usize| *cap > 0)
            .unwrap_or(defaults.max_pending_candidates);

        let auto_answer = env_truthy("TANDEM_AUTO_ANSWER").unwrap_or(defaults.auto_answer);

        Self {
            relay_url,
            ice_servers,
            max_pending_candidates,
            auto_answer,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
            auto_answer: true,
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn env_truthy(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
