//! Runtime configuration, read once from the environment at startup.
//!
//! Every knob has a default so the server runs with no environment at all.

use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent data directory (`~/.claude`), holds `history.jsonl` and `projects/`
    pub claude_dir: PathBuf,
    pub port: u16,
    /// Live tail tick interval
    pub poll_interval: Duration,
    /// Freshness deadline for the session index cache
    pub index_ttl: Duration,
    /// Static frontend served as the router fallback
    pub static_dir: PathBuf,
    /// Allow cross-origin requests (frontend dev server on another port)
    pub cors: bool,
    /// Invalidate the session index when the history log changes on disk
    pub watch_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/home/user".to_string());
        Self {
            claude_dir: PathBuf::from(&home).join(".claude"),
            port: 4860,
            poll_interval: Duration::from_millis(500),
            index_ttl: Duration::from_secs(30),
            static_dir: PathBuf::from("static"),
            cors: false,
            watch_history: true,
        }
    }
}

impl Config {
    /// Build the config from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (unset keys keep defaults).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(home) = lookup("HOME") {
            config.claude_dir = PathBuf::from(home).join(".claude");
        }
        if let Some(dir) = lookup("CLAUDE_DIR").filter(|d| !d.trim().is_empty()) {
            config.claude_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Some(ms) = lookup("SYMPHONY_POLL_MS").and_then(|v| v.parse::<u64>().ok()) {
            // A zero period would make tokio's interval panic
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = lookup("SYMPHONY_INDEX_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.index_ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("SYMPHONY_STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("SYMPHONY_CORS").and_then(|v| parse_flag(&v)) {
            config.cors = flag;
        }
        if let Some(flag) = lookup("SYMPHONY_WATCH_HISTORY").and_then(|v| parse_flag(&v)) {
            config.watch_history = flag;
        }

        config
    }

    /// `<claude_dir>/projects`, one directory per encoded project path
    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }

    /// `<claude_dir>/history.jsonl`, the master append-only history log
    pub fn history_path(&self) -> PathBuf {
        self.claude_dir.join("history.jsonl")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
