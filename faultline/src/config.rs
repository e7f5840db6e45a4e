//! Application configuration loaded from the environment.

use std::str::FromStr;

use notification_sync::{Error, Result, SyncConfig};
use serde::{Deserialize, Serialize};

const ENV_API_URL: &str = "FAULTLINE_API_URL";
const ENV_API_KEY: &str = "FAULTLINE_API_KEY";
const ENV_ACCESS_TOKEN: &str = "FAULTLINE_ACCESS_TOKEN";
const ENV_USER_ID: &str = "FAULTLINE_USER_ID";
const ENV_POLL_INTERVAL_MS: &str = "FAULTLINE_POLL_INTERVAL_MS";
const ENV_PENDING_GRACE_MS: &str = "FAULTLINE_PENDING_GRACE_MS";
const ENV_HTTP_TIMEOUT_SECS: &str = "FAULTLINE_HTTP_TIMEOUT_SECS";
const ENV_LOG_DIR: &str = "FAULTLINE_LOG_DIR";

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the managed data platform.
    pub api_url: String,
    /// Public API key sent with every request.
    pub api_key: String,
    /// Session access token. Falls back to the API key when absent.
    pub access_token: Option<String>,
    /// Signed-in user. No user means no notification session.
    pub user_id: Option<String>,
    /// Request timeout in seconds.
    pub http_timeout_secs: u64,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<String>,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Load `.env` (if present) and read the configuration from the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let required = |key: &str| {
            get(key).ok_or_else(|| Error::config(format!("{key} is required")))
        };
        let api_url = required(ENV_API_URL)?;
        let api_key = required(ENV_API_KEY)?;

        let defaults = SyncConfig::default();
        let poll_interval_ms = parse_or(
            get(ENV_POLL_INTERVAL_MS),
            ENV_POLL_INTERVAL_MS,
            defaults.poll_interval_ms,
        )?;
        // Grace never outlives one poll interval.
        let pending_grace_ms = parse_or(
            get(ENV_PENDING_GRACE_MS),
            ENV_PENDING_GRACE_MS,
            defaults.pending_grace_ms.min(poll_interval_ms),
        )?;
        let sync = SyncConfig {
            poll_interval_ms,
            pending_grace_ms,
            ..defaults
        };
        sync.validate()?;

        Ok(Self {
            api_url,
            api_key,
            access_token: get(ENV_ACCESS_TOKEN),
            user_id: get(ENV_USER_ID),
            http_timeout_secs: parse_or(get(ENV_HTTP_TIMEOUT_SECS), ENV_HTTP_TIMEOUT_SECS, 30)?,
            log_dir: get(ENV_LOG_DIR),
            sync,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "https://example.supabase.co");
        assert_eq!(config.access_token, None);
        assert_eq!(config.user_id, None);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
            (ENV_USER_ID, " user-7 "),
            (ENV_POLL_INTERVAL_MS, "2500"),
            (ENV_PENDING_GRACE_MS, "1000"),
            (ENV_LOG_DIR, ""),
        ]))
        .unwrap();

        assert_eq!(config.user_id.as_deref(), Some("user-7"));
        assert_eq!(config.sync.poll_interval_ms, 2500);
        assert_eq!(config.sync.pending_grace_ms, 1000);
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn test_short_interval_shortens_default_grace() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
            (ENV_POLL_INTERVAL_MS, "2000"),
        ]))
        .unwrap();
        assert_eq!(config.sync.pending_grace_ms, 2000);

        let err = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
            (ENV_POLL_INTERVAL_MS, "2000"),
            (ENV_PENDING_GRACE_MS, "4000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_api_url() {
        let err = AppConfig::from_lookup(lookup(&[(ENV_API_KEY, "anon-key")])).unwrap_err();
        assert!(err.to_string().contains(ENV_API_URL));
    }

    #[test]
    fn test_invalid_number() {
        let err = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
            (ENV_POLL_INTERVAL_MS, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://example.supabase.co"),
            (ENV_API_KEY, "anon-key"),
            (ENV_POLL_INTERVAL_MS, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
