//! Configuration module for netdiag.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::channel::ReconnectPolicy;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the remote executor
    pub executor_url: String,
    /// DNS-over-HTTPS endpoint used for resolvability checks
    pub doh_url: String,
    /// Path to the SQLite snapshot database (default: "netdiag.db")
    pub db_path: String,
    /// Commands admitted per rate window
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub reconnect: ReconnectPolicy,
    pub resolve_timeout: Duration,
    pub resolve_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            executor_url: "ws://localhost:8080/ws".to_string(),
            doh_url: "https://cloudflare-dns.com/dns-query".to_string(),
            db_path: "netdiag.db".to_string(),
            rate_limit: 10,
            rate_window: Duration::from_millis(60_000),
            reconnect: ReconnectPolicy::default(),
            resolve_timeout: Duration::from_secs(5),
            resolve_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETDIAG_EXECUTOR_URL`: executor WebSocket URL (default: "ws://localhost:8080/ws")
    /// - `NETDIAG_DOH_URL`: DNS-over-HTTPS endpoint
    /// - `NETDIAG_DB_PATH`: snapshot database path (default: "netdiag.db")
    /// - `NETDIAG_RATE_LIMIT` / `NETDIAG_RATE_WINDOW_MS`: admission gate (default: 10 per 60000 ms)
    /// - `NETDIAG_RECONNECT_MODE`: "backoff" (default) or "fixed"
    /// - `NETDIAG_RECONNECT_DELAY_MS` / `NETDIAG_RECONNECT_MAX_MS`: reconnect delays
    /// - `NETDIAG_RESOLVE_TIMEOUT_MS` / `NETDIAG_RESOLVE_CACHE_SECS`: resolvability check
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(url) = lookup("NETDIAG_EXECUTOR_URL") {
            cfg.executor_url = url;
        }
        if let Some(url) = lookup("NETDIAG_DOH_URL") {
            cfg.doh_url = url;
        }
        if let Some(db_path) = lookup("NETDIAG_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "NETDIAG_RATE_LIMIT") {
            cfg.rate_limit = limit;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "NETDIAG_RATE_WINDOW_MS") {
            cfg.rate_window = Duration::from_millis(ms);
        }

        let delay = parse_var::<u64>(&lookup, "NETDIAG_RECONNECT_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(ReconnectPolicy::DEFAULT_DELAY);
        let max = parse_var::<u64>(&lookup, "NETDIAG_RECONNECT_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or(ReconnectPolicy::DEFAULT_MAX_DELAY);
        cfg.reconnect = match lookup("NETDIAG_RECONNECT_MODE").as_deref() {
            Some("fixed") => ReconnectPolicy::Fixed(delay),
            _ => ReconnectPolicy::Backoff {
                initial: delay,
                max: max.max(delay),
            },
        };

        if let Some(ms) = parse_var::<u64>(&lookup, "NETDIAG_RESOLVE_TIMEOUT_MS") {
            cfg.resolve_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "NETDIAG_RESOLVE_CACHE_SECS") {
            cfg.resolve_cache_ttl = Duration::from_secs(secs);
        }

        cfg
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}
