//! Command surface consumed by UIs and the daemon's stdin protocol.
//!
//! Commands arrive as JSON objects tagged by `command`:
//!
//! ```json
//! {"command": "upsert", "topicId": "1024", "entryId": "7", "replyCount": 3}
//! {"command": "clear-unread", "topicId": "1024"}
//! {"command": "set-crawl-enabled", "enabled": false}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{EntryKey, TrackedEntry};

const MAX_ID_LEN: usize = 20;
const MAX_TITLE_CHARS: usize = 300;

/// A request to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Track an entry, or refresh an already tracked one
    Upsert(UpsertRequest),
    RemoveEntry(EntryRef),
    RemoveTopic(TopicRef),
    /// Acknowledge new replies of one entry, or of a whole topic
    ClearUnread(ClearUnreadRequest),
    ListAll,
    CrawlNow,
    SetCrawlEnabled(SwitchRequest),
    GetCrawlEnabled,
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Upsert(_) => "upsert",
            Command::RemoveEntry(_) => "remove-entry",
            Command::RemoveTopic(_) => "remove-topic",
            Command::ClearUnread(_) => "clear-unread",
            Command::ListAll => "list-all",
            Command::CrawlNow => "crawl-now",
            Command::SetCrawlEnabled(_) => "set-crawl-enabled",
            Command::GetCrawlEnabled => "get-crawl-enabled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub topic_id: String,
    pub entry_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
    /// Reply counter currently shown on the page
    #[serde(default)]
    pub reply_count: Option<u64>,
}

impl UpsertRequest {
    pub fn key(&self) -> Result<EntryKey> {
        validate_id("topicId", &self.topic_id)?;
        validate_id("entryId", &self.entry_id)?;
        if let Some(title) = &self.title {
            if title.chars().count() > MAX_TITLE_CHARS {
                return Err(AppError::validation(format!(
                    "title exceeds {MAX_TITLE_CHARS} characters"
                )));
            }
        }
        Ok(EntryKey::new(&self.topic_id, &self.entry_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRef {
    pub topic_id: String,
    pub entry_id: String,
}

impl EntryRef {
    pub fn key(&self) -> Result<EntryKey> {
        validate_id("topicId", &self.topic_id)?;
        validate_id("entryId", &self.entry_id)?;
        Ok(EntryKey::new(&self.topic_id, &self.entry_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRef {
    pub topic_id: String,
}

impl TopicRef {
    pub fn topic(&self) -> Result<&str> {
        validate_id("topicId", &self.topic_id)?;
        Ok(&self.topic_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearUnreadRequest {
    pub topic_id: String,
    /// Clears every entry of the topic when absent
    #[serde(default)]
    pub entry_id: Option<String>,
}

impl ClearUnreadRequest {
    /// The single entry to clear, or `None` for the whole topic.
    pub fn target(&self) -> Result<Option<EntryKey>> {
        validate_id("topicId", &self.topic_id)?;
        match &self.entry_id {
            Some(entry_id) => {
                validate_id("entryId", entry_id)?;
                Ok(Some(EntryKey::new(&self.topic_id, entry_id)))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub enabled: bool,
}

/// Outcome of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Entries affected, or updated by a crawl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<TrackedEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Unread total after the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_entries(mut self, entries: Vec<TrackedEntry>) -> Self {
        self.entries = Some(entries);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

/// Identifiers are opaque numeric strings.
fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::validation(format!("{field} is empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(AppError::validation(format!(
            "{field} is longer than {MAX_ID_LEN} digits"
        )));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::validation(format!(
            "{field} must be numeric, got {value:?}"
        )));
    }
    Ok(())
}
