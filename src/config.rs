use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// User-agent presented to the scraped site and the file hosts. Some of the
/// gateway pages serve different markup to non-browser agents.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    /// Base URL of the WordPress-style search index being scraped.
    pub site_base_url: String,
    /// Prefix that starts a search flow, e.g. "!movie inception".
    pub command_prefix: String,
    pub staging_dir: PathBuf,
    /// Inactivity window after which a conversation's flow is abandoned.
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// Transport upload cap; larger artifacts fall back to a link.
    pub max_upload_bytes: u64,
    pub http_timeout: Duration,
    /// Hosts whose links on a detail page are already final.
    pub direct_hosts: Vec<String>,
    /// Hosts that gate the real URL behind a hidden-form unlock page.
    pub gateway_hosts: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discord_token = dotenv::var("DISCORD_TOKEN").context("DISCORD_TOKEN required")?;
        let site_base_url = dotenv::var("SITE_BASE_URL")
            .unwrap_or_else(|_| "https://ssrmovies.autos".to_string());
        let command_prefix =
            dotenv::var("COMMAND_PREFIX").unwrap_or_else(|_| "!movie".to_string());
        let staging_dir = dotenv::var("STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("reelbot"));

        Ok(Self {
            discord_token,
            site_base_url,
            command_prefix,
            staging_dir,
            session_ttl: Duration::from_secs(env_u64("SESSION_TTL_SECS", 600)),
            sweep_interval: Duration::from_secs(env_u64("SWEEP_INTERVAL_SECS", 60)),
            max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", 25 * 1024 * 1024),
            http_timeout: Duration::from_secs(env_u64("HTTP_TIMEOUT_SECS", 30)),
            direct_hosts: env_list("DIRECT_HOSTS", "pixeldrain,mega.nz,devuploads"),
            gateway_hosts: env_list("GATEWAY_HOSTS", "gdflix,hubcloud,fastilinks"),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    dotenv::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Comma-separated env list with a code default, entries trimmed and lowercased.
fn env_list(key: &str, default: &str) -> Vec<String> {
    dotenv::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
