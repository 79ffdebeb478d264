// src/services/replies.rs

//! Remote reply counter.
//!
//! Reads the reply counter of a single entry from the thread page that
//! contains it, using a configured CSS selector.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Config, SiteConfig};
use crate::utils::http::{create_async_client, fetch_text};
use crate::utils::retry::{RetryPolicy, with_retry};

/// Source of remote reply counts.
#[async_trait]
pub trait ReplyCounter: Send + Sync {
    /// The entry's current reply count, or `None` when it could not be
    /// determined for any reason.
    async fn fetch_reply_count(&self, topic_id: &str, entry_id: &str) -> Option<u64>;
}

/// Reply counter backed by the site's HTML pages.
pub struct HttpReplyCounter {
    client: Client,
    site: SiteConfig,
    per_page: u64,
    retry: RetryPolicy,
}

impl HttpReplyCounter {
    /// Create a new counter with the given configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let client = create_async_client(&config.crawler)?;
        let retry = RetryPolicy::exponential(
            config.crawler.fetch_attempts,
            config.storage.retry_policy().base_delay,
        );
        Ok(Self {
            client,
            site: config.site.clone(),
            per_page: config.crawler.per_page.max(1),
            retry,
        })
    }

    /// Thread page (1-based) on which a numeric entry id appears.
    pub fn page_for(entry_id: &str, per_page: u64) -> u64 {
        let index: u64 = entry_id.parse().unwrap_or(1);
        index.saturating_sub(1) / per_page.max(1) + 1
    }

    /// URL of the thread page holding the entry.
    pub fn thread_url(&self, topic_id: &str, entry_id: &str) -> Result<Url> {
        let page = Self::page_for(entry_id, self.per_page);
        let raw = self
            .site
            .thread_url_template
            .replace("{topic_id}", topic_id)
            .replace("{entry_id}", entry_id)
            .replace("{page}", &page.to_string());
        Ok(Url::parse(&raw)?)
    }

    /// Extract the entry's counter from a thread page.
    pub fn parse_count(html: &str, selector_template: &str, entry_id: &str) -> Result<Option<u64>> {
        let selector_str = selector_template.replace("{entry_id}", entry_id);
        let selector = Self::parse_selector(&selector_str)?;
        let document = Html::parse_document(html);

        let Some(element) = document.select(&selector).next() else {
            return Ok(None);
        };
        let text: String = element.text().collect();
        Ok(count_pattern()
            .find(&text)
            .and_then(|m| m.as_str().replace(',', "").parse().ok()))
    }

    async fn try_fetch(&self, topic_id: &str, entry_id: &str) -> Result<Option<u64>> {
        let url = self.thread_url(topic_id, entry_id)?;
        let context = format!("topic {topic_id} entry {entry_id}");
        let html = with_retry(&self.retry, &context, || fetch_text(&self.client, url.as_str())).await?;
        Self::parse_count(&html, &self.site.reply_count_selector, entry_id)
    }

    fn parse_selector(s: &str) -> Result<Selector> {
        Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
    }
}

#[async_trait]
impl ReplyCounter for HttpReplyCounter {
    async fn fetch_reply_count(&self, topic_id: &str, entry_id: &str) -> Option<u64> {
        match self.try_fetch(topic_id, entry_id).await {
            Ok(Some(count)) => Some(count),
            Ok(None) => {
                log::warn!("No reply counter found for topic {topic_id} entry {entry_id}");
                None
            }
            Err(e) => {
                log::warn!("Failed to fetch reply count for topic {topic_id} entry {entry_id}: {e}");
                None
            }
        }
    }
}

fn count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d[\d,]*").expect("static pattern"))
}
