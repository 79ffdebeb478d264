//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::retry::RetryPolicy;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Polling and HTTP behavior settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote site layout
    #[serde(default)]
    pub site: SiteConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Serialize to TOML text.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `TRACKER_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "TRACKER_ACTIVE_DELAY_MS", &mut self.crawler.active_delay_ms);
        override_from(&lookup, "TRACKER_IDLE_DELAY_MS", &mut self.crawler.idle_delay_ms);
        override_from(&lookup, "TRACKER_STALE_AFTER_DAYS", &mut self.crawler.stale_after_days);
        override_from(&lookup, "TRACKER_PER_PAGE", &mut self.crawler.per_page);
        override_from(&lookup, "TRACKER_RETRY_ATTEMPTS", &mut self.storage.retry_attempts);
        override_from(
            &lookup,
            "TRACKER_RETRY_BASE_DELAY_MS",
            &mut self.storage.retry_base_delay_ms,
        );
        override_from(&lookup, "TRACKER_MAX_ENTRIES", &mut self.storage.max_entries);
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.per_page == 0 {
            return Err(AppError::validation("crawler.per_page must be > 0"));
        }
        if self.crawler.fetch_attempts == 0 {
            return Err(AppError::validation("crawler.fetch_attempts must be > 0"));
        }
        if self.storage.retry_attempts == 0 {
            return Err(AppError::validation("storage.retry_attempts must be > 0"));
        }
        if self.storage.max_entries == 0 {
            return Err(AppError::validation("storage.max_entries must be > 0"));
        }
        if !self.site.thread_url_template.contains("{topic_id}") {
            return Err(AppError::validation(
                "site.thread_url_template must contain {topic_id}",
            ));
        }
        Ok(())
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring {name}={raw:?}: not a valid value"),
    }
}

/// Polling loop and HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Delay between entries, and between cycles that updated something
    #[serde(default = "defaults::active_delay")]
    pub active_delay_ms: u64,

    /// Delay between cycles that updated nothing
    #[serde(default = "defaults::idle_delay")]
    pub idle_delay_ms: u64,

    /// Replies posted longer ago than this are not polled
    #[serde(default = "defaults::stale_after_days")]
    pub stale_after_days: u32,

    /// Replies shown per thread page on the site
    #[serde(default = "defaults::per_page")]
    pub per_page: u64,

    /// Attempts per remote fetch
    #[serde(default = "defaults::fetch_attempts")]
    pub fetch_attempts: usize,

    /// Interval of the unread-total consistency check
    #[serde(default = "defaults::consistency_check")]
    pub consistency_check_secs: u64,
}

impl CrawlerConfig {
    pub fn active_delay(&self) -> Duration {
        Duration::from_millis(self.active_delay_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            active_delay_ms: defaults::active_delay(),
            idle_delay_ms: defaults::idle_delay(),
            stale_after_days: defaults::stale_after_days(),
            per_page: defaults::per_page(),
            fetch_attempts: defaults::fetch_attempts(),
            consistency_check_secs: defaults::consistency_check(),
        }
    }
}

/// Entry persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Entries kept before the least recently updated are evicted
    #[serde(default = "defaults::max_entries")]
    pub max_entries: usize,

    /// Attempts per persistence operation
    #[serde(default = "defaults::retry_attempts")]
    pub retry_attempts: usize,

    /// First backoff delay; doubles on each further attempt
    #[serde(default = "defaults::retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "defaults::retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Maximum body excerpt length in characters
    #[serde(default = "defaults::excerpt_chars")]
    pub excerpt_chars: usize,
}

impl StorageConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_entries: defaults::max_entries(),
            retry_attempts: defaults::retry_attempts(),
            retry_base_delay_ms: defaults::retry_base_delay(),
            retry_max_delay_ms: defaults::retry_max_delay(),
            excerpt_chars: defaults::excerpt_chars(),
        }
    }
}

/// Where and how reply counters are read on the remote site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Thread page URL with `{topic_id}`, `{entry_id}` and `{page}` placeholders
    #[serde(default = "defaults::thread_url_template")]
    pub thread_url_template: String,

    /// CSS selector of the reply counter, `{entry_id}` is substituted
    #[serde(default = "defaults::reply_count_selector")]
    pub reply_count_selector: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            thread_url_template: defaults::thread_url_template(),
            reply_count_selector: defaults::reply_count_selector(),
        }
    }
}

mod defaults {
    // Crawler defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; reply-tracker/0.1)".into()
    }
    pub fn timeout() -> u64 {
        15
    }
    pub fn active_delay() -> u64 {
        3_000
    }
    pub fn idle_delay() -> u64 {
        600_000
    }
    pub fn stale_after_days() -> u32 {
        31
    }
    pub fn per_page() -> u64 {
        50
    }
    pub fn fetch_attempts() -> usize {
        2
    }
    pub fn consistency_check() -> u64 {
        900
    }

    // Storage defaults
    pub fn max_entries() -> usize {
        500
    }
    pub fn retry_attempts() -> usize {
        3
    }
    pub fn retry_base_delay() -> u64 {
        200
    }
    pub fn retry_max_delay() -> u64 {
        5_000
    }
    pub fn excerpt_chars() -> usize {
        200
    }

    // Site defaults
    pub fn thread_url_template() -> String {
        "https://forum.example.com/topic/{topic_id}?page={page}".into()
    }
    pub fn reply_count_selector() -> String {
        "#reply-{entry_id} .reply-count".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crawler.stale_after_days, 31);
        assert_eq!(config.storage.retry_attempts, 3);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [crawler]
            active_delay_ms = 10

            [storage]
            max_entries = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.crawler.active_delay_ms, 10);
        assert_eq!(config.crawler.idle_delay_ms, 600_000);
        assert_eq!(config.storage.max_entries, 3);
        assert_eq!(config.storage.excerpt_chars, 200);
    }

    #[test]
    fn test_toml_roundtrip() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.site.reply_count_selector, "#reply-{entry_id} .reply-count");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TRACKER_MAX_ENTRIES", "42"),
            ("TRACKER_ACTIVE_DELAY_MS", "not-a-number"),
            ("TRACKER_RETRY_ATTEMPTS", " 5 "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.max_entries, 42);
        assert_eq!(config.storage.retry_attempts, 5);
        assert_eq!(config.crawler.active_delay_ms, 3_000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.storage.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.site.thread_url_template = "https://example.com/".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/config.toml");
        assert_eq!(config.storage.max_entries, 500);
    }
}
