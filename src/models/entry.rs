//! Tracked entry data structure.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Storage namespace for tracked entries.
pub const ENTRY_PREFIX: &str = "entry:";

/// Naive formats accepted for `posted_at`, tried in order after RFC 3339.
const POSTED_AT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"];
const POSTED_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d"];

/// Unique identity of a tracked entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
    pub topic_id: String,
    pub entry_id: String,
}

impl EntryKey {
    pub fn new(topic_id: impl Into<String>, entry_id: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            entry_id: entry_id.into(),
        }
    }

    /// Key under which the entry is persisted.
    pub fn storage_key(&self) -> String {
        format!("{ENTRY_PREFIX}{}:{}", self.topic_id, self.entry_id)
    }

    /// Prefix shared by every entry of a topic.
    pub fn topic_prefix(topic_id: &str) -> String {
        format!("{ENTRY_PREFIX}{topic_id}:")
    }

    /// Parse a persisted key back into its identity.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(ENTRY_PREFIX)?;
        let (topic_id, entry_id) = rest.split_once(':')?;
        if topic_id.is_empty() || entry_id.is_empty() {
            return None;
        }
        Some(Self::new(topic_id, entry_id))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic_id, self.entry_id)
    }
}

/// A reply the user has chosen to monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntry {
    /// Discussion thread identifier
    pub topic_id: String,

    /// Reply identifier within the thread
    pub entry_id: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Short text excerpt of the reply
    #[serde(default)]
    pub body: Option<String>,

    /// When the reply was posted, as shown by the site
    #[serde(default)]
    pub posted_at: Option<String>,

    /// Last observed remote reply counter
    #[serde(default)]
    pub reply_count: u64,

    /// Reply growth not yet acknowledged
    #[serde(default)]
    pub unread_count: u64,

    pub created_at: DateTime<Utc>,

    /// Absent only on entries that were never persisted
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub version: u64,
}

impl TrackedEntry {
    /// Create a fresh, never-persisted entry.
    pub fn new(topic_id: impl Into<String>, entry_id: impl Into<String>, reply_count: u64) -> Self {
        Self {
            topic_id: topic_id.into(),
            entry_id: entry_id.into(),
            title: None,
            body: None,
            posted_at: None,
            reply_count,
            unread_count: 0,
            created_at: Utc::now(),
            updated_at: None,
            version: 0,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.topic_id.clone(), self.entry_id.clone())
    }

    /// Posted time, if present and in a recognised format.
    pub fn posted_time(&self) -> Option<DateTime<Utc>> {
        self.posted_at.as_deref().and_then(parse_posted_at)
    }

    /// Whether the reply is older than `max_age_days` at `now`.
    ///
    /// Entries without a readable posted time are never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_days: u32) -> bool {
        self.posted_time()
            .is_some_and(|posted| now - posted > chrono::Duration::days(i64::from(max_age_days)))
    }

    /// Clamp the body to at most `max_graphemes` user-visible characters.
    pub fn truncate_body(&mut self, max_graphemes: usize) {
        if let Some(body) = self.body.as_mut() {
            *body = excerpt(body, max_graphemes);
        }
    }
}

/// Parse the site's posted-at text into a UTC instant.
pub fn parse_posted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in POSTED_AT_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    for format in POSTED_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Take the first `max_graphemes` grapheme clusters of `text`.
pub fn excerpt(text: &str, max_graphemes: usize) -> String {
    let trimmed = text.trim();
    match trimmed.grapheme_indices(true).nth(max_graphemes) {
        Some((cut, _)) => trimmed[..cut].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}
