// src/pipeline/commands.rs

//! Command surface of the tracker.
//!
//! Every command is validated before it reaches the store, and every outcome
//! is reduced to a [`CommandResponse`]; no error escapes [`Tracker::handle`].

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::models::{
    ClearUnreadRequest, Command, CommandResponse, Config, EntryKey, TrackedEntry, UpsertRequest,
};
use crate::services::{
    CrawlEngine, CrawlSwitch, EntryCache, EntryStore, PutOutcome, ReplyCounter, UnreadAccounter,
    UnreadSink, reconcile_entry,
};
use crate::storage::{CRAWL_ENABLED_KEY, KvStore};
use crate::utils::retry::{RetryPolicy, with_retry};

/// Wired-up tracker: store, cache, accounter and crawl engine.
pub struct Tracker {
    config: Config,
    kv: Arc<dyn KvStore>,
    store: Arc<EntryStore>,
    engine: Arc<CrawlEngine>,
}

impl Tracker {
    /// Build all components, warm the cache and recompute the unread total.
    pub async fn open(
        config: Config,
        kv: Arc<dyn KvStore>,
        counter: Arc<dyn ReplyCounter>,
        sink: Option<Arc<dyn UnreadSink>>,
    ) -> Result<Self> {
        let retry = config.storage.retry_policy();

        let mut accounter = UnreadAccounter::new(Arc::clone(&kv), retry.clone());
        if let Some(sink) = sink {
            accounter = accounter.with_sink(sink);
        }
        let accounter = Arc::new(accounter);

        let cache = Arc::new(EntryCache::new());
        let store = Arc::new(EntryStore::new(
            Arc::clone(&kv),
            Arc::clone(&cache),
            Arc::clone(&accounter),
            &config.storage,
        ));

        cache.load_from_store(&store).await?;
        accounter.recompute(&cache).await?;

        let enabled = load_crawl_enabled(kv.as_ref(), &retry).await;
        let engine = Arc::new(CrawlEngine::new(
            Arc::clone(&store),
            counter,
            CrawlSwitch::new(enabled),
            config.crawler.clone(),
        ));

        Ok(Self {
            config,
            kv,
            store,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<CrawlEngine> {
        &self.engine
    }

    pub fn accounter(&self) -> &Arc<UnreadAccounter> {
        self.store.accounter()
    }

    /// Execute a command, turning any failure into an unsuccessful response.
    pub async fn handle(&self, command: Command) -> CommandResponse {
        let name = command.name();
        match self.execute(command).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Command {name} failed: {e}");
                CommandResponse::failure(e.to_string())
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<CommandResponse> {
        match command {
            Command::Upsert(request) => self.upsert(request).await,
            Command::RemoveEntry(entry) => {
                let key = entry.key()?;
                let removed = self.store.delete(&key).await?;
                Ok(self.done().with_count(usize::from(removed.is_some())))
            }
            Command::RemoveTopic(topic) => {
                let removed = self.store.delete_topic(topic.topic()?).await?;
                Ok(self.done().with_count(removed))
            }
            Command::ClearUnread(request) => self.clear_unread(request).await,
            Command::ListAll => {
                let entries = self.store.cache().get_all()?;
                Ok(self.done().with_count(entries.len()).with_entries(entries))
            }
            Command::CrawlNow => {
                let report = self.engine.run_cycle().await;
                Ok(self.done().with_count(report.updated))
            }
            Command::SetCrawlEnabled(request) => {
                let retry = self.config.storage.retry_policy();
                with_retry(&retry, "persist crawl switch", || {
                    self.kv.set(CRAWL_ENABLED_KEY, Value::Bool(request.enabled))
                })
                .await?;
                if self.engine.switch().set(request.enabled) {
                    log::info!("Crawling {}", if request.enabled { "enabled" } else { "disabled" });
                }
                Ok(CommandResponse::ok().with_enabled(request.enabled))
            }
            Command::GetCrawlEnabled => Ok(self
                .done()
                .with_enabled(self.engine.switch().is_enabled())),
        }
    }

    async fn upsert(&self, request: UpsertRequest) -> Result<CommandResponse> {
        let key = request.key()?;

        let mut entry = match self.store.get(&key).await? {
            Some(mut existing) => {
                if request.title.is_some() {
                    existing.title = request.title;
                }
                if request.body.is_some() {
                    existing.body = request.body;
                }
                if request.posted_at.is_some() {
                    existing.posted_at = request.posted_at;
                }
                if let Some(reply_count) = request.reply_count {
                    reconcile_entry(&existing, reply_count).apply_to(&mut existing);
                }
                existing
            }
            None => {
                let mut fresh =
                    TrackedEntry::new(request.topic_id, request.entry_id, request.reply_count.unwrap_or(0));
                fresh.title = request.title;
                fresh.body = request.body;
                fresh.posted_at = request.posted_at;
                fresh
            }
        };
        entry.truncate_body(self.config.storage.excerpt_chars);

        match self.store.put(entry).await? {
            PutOutcome::Written(written) => Ok(self.done().with_count(1).with_entries(vec![written])),
            PutOutcome::Stale { .. } => Ok(conflict(&key)),
        }
    }

    async fn clear_unread(&self, request: ClearUnreadRequest) -> Result<CommandResponse> {
        let targets = match request.target()? {
            Some(key) => match self.store.get(&key).await? {
                Some(entry) => vec![entry],
                None => return Ok(CommandResponse::failure(format!("{key} is not tracked"))),
            },
            None => self.store.load_topic(&request.topic_id).await?,
        };

        let mut cleared = 0;
        for mut entry in targets {
            if entry.unread_count == 0 {
                continue;
            }
            let key = entry.key();
            entry.unread_count = 0;
            match self.store.put(entry).await? {
                PutOutcome::Written(_) => cleared += 1,
                PutOutcome::Stale { .. } if request.entry_id.is_some() => return Ok(conflict(&key)),
                PutOutcome::Stale { .. } => log::info!("{key} changed while clearing; left unread"),
            }
        }
        Ok(self.done().with_count(cleared))
    }

    /// Successful response carrying the current unread total.
    fn done(&self) -> CommandResponse {
        CommandResponse::ok().with_total(self.accounter().total())
    }
}

fn conflict(key: &EntryKey) -> CommandResponse {
    CommandResponse::failure(format!("{key} was modified concurrently; retry"))
}

async fn load_crawl_enabled(kv: &dyn KvStore, retry: &RetryPolicy) -> bool {
    match with_retry(retry, "read crawl switch", || kv.get(CRAWL_ENABLED_KEY)).await {
        Ok(value) => value.and_then(|v| v.as_bool()).unwrap_or(true),
        Err(e) => {
            log::warn!("Could not read crawl switch, assuming enabled: {e}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryRef, SwitchRequest, TopicRef};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    struct FixedCounter(u64);

    #[async_trait]
    impl ReplyCounter for FixedCounter {
        async fn fetch_reply_count(&self, _topic_id: &str, _entry_id: &str) -> Option<u64> {
            Some(self.0)
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.crawler.active_delay_ms = 0;
        config.storage.excerpt_chars = 10;
        config
    }

    async fn tracker_on(kv: Arc<dyn KvStore>, remote: u64) -> Tracker {
        Tracker::open(test_config(), kv, Arc::new(FixedCounter(remote)), None)
            .await
            .unwrap()
    }

    fn upsert(topic: &str, entry: &str, replies: Option<u64>) -> Command {
        Command::Upsert(UpsertRequest {
            topic_id: topic.into(),
            entry_id: entry.into(),
            reply_count: replies,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_upsert_creates_entry_with_excerpt() {
        let tracker = tracker_on(Arc::new(MemoryStorage::new()), 0).await;
        let response = tracker
            .handle(Command::Upsert(UpsertRequest {
                topic_id: "1".into(),
                entry_id: "2".into(),
                body: Some("a rather long reply body".into()),
                reply_count: Some(3),
                ..Default::default()
            }))
            .await;

        assert!(response.success);
        let entries = response.entries.unwrap();
        assert_eq!(entries[0].body.as_deref(), Some("a rather l"));
        assert_eq!(entries[0].reply_count, 3);
        assert_eq!(entries[0].unread_count, 0);
        assert_eq!(entries[0].version, 1);
    }

    #[tokio::test]
    async fn test_upsert_existing_accumulates_unread() {
        let tracker = tracker_on(Arc::new(MemoryStorage::new()), 0).await;
        tracker.handle(upsert("1", "2", Some(3))).await;
        let response = tracker.handle(upsert("1", "2", Some(6))).await;

        let entry = &response.entries.unwrap()[0];
        assert_eq!((entry.reply_count, entry.unread_count), (6, 3));
        assert_eq!(response.total, Some(3));
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected_before_store() {
        let kv = Arc::new(MemoryStorage::new());
        let tracker = tracker_on(kv.clone(), 0).await;
        let response = tracker.handle(upsert("1x", "2", None)).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("topicId"));
        assert!(kv.scan("entry:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_unread_single_and_topic() {
        let tracker = tracker_on(Arc::new(MemoryStorage::new()), 10).await;
        tracker.handle(upsert("1", "1", Some(0))).await;
        tracker.handle(upsert("1", "2", Some(0))).await;
        tracker.handle(upsert("2", "1", Some(0))).await;
        let crawled = tracker.handle(Command::CrawlNow).await;
        assert_eq!(crawled.count, Some(3));
        assert_eq!(tracker.accounter().total(), 30);

        let single = tracker
            .handle(Command::ClearUnread(ClearUnreadRequest {
                topic_id: "1".into(),
                entry_id: Some("1".into()),
            }))
            .await;
        assert_eq!(single.count, Some(1));
        assert_eq!(single.total, Some(20));

        let topic = tracker
            .handle(Command::ClearUnread(ClearUnreadRequest {
                topic_id: "1".into(),
                entry_id: None,
            }))
            .await;
        assert_eq!(topic.count, Some(1));
        assert_eq!(topic.total, Some(10));
    }

    #[tokio::test]
    async fn test_clear_unread_unknown_entry() {
        let tracker = tracker_on(Arc::new(MemoryStorage::new()), 0).await;
        let response = tracker
            .handle(Command::ClearUnread(ClearUnreadRequest {
                topic_id: "1".into(),
                entry_id: Some("9".into()),
            }))
            .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_remove_entry_and_topic() {
        let tracker = tracker_on(Arc::new(MemoryStorage::new()), 0).await;
        tracker.handle(upsert("1", "1", None)).await;
        tracker.handle(upsert("1", "2", None)).await;
        tracker.handle(upsert("3", "1", None)).await;

        let removed = tracker
            .handle(Command::RemoveEntry(EntryRef {
                topic_id: "3".into(),
                entry_id: "1".into(),
            }))
            .await;
        assert_eq!(removed.count, Some(1));

        let again = tracker
            .handle(Command::RemoveEntry(EntryRef {
                topic_id: "3".into(),
                entry_id: "1".into(),
            }))
            .await;
        assert!(again.success);
        assert_eq!(again.count, Some(0));

        let topic = tracker
            .handle(Command::RemoveTopic(TopicRef {
                topic_id: "1".into(),
            }))
            .await;
        assert_eq!(topic.count, Some(2));

        let listed = tracker.handle(Command::ListAll).await;
        assert_eq!(listed.count, Some(0));
    }

    #[tokio::test]
    async fn test_crawl_switch_persists_across_open() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
        let tracker = tracker_on(kv.clone(), 0).await;
        assert_eq!(tracker.handle(Command::GetCrawlEnabled).await.enabled, Some(true));

        let response = tracker
            .handle(Command::SetCrawlEnabled(SwitchRequest { enabled: false }))
            .await;
        assert_eq!(response.enabled, Some(false));

        let reopened = tracker_on(kv, 0).await;
        assert_eq!(reopened.handle(Command::GetCrawlEnabled).await.enabled, Some(false));
        assert_eq!(reopened.handle(Command::CrawlNow).await.count, Some(0));
    }

    #[tokio::test]
    async fn test_reopen_recomputes_total() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
        let tracker = tracker_on(kv.clone(), 7).await;
        tracker.handle(upsert("1", "1", Some(2))).await;
        tracker.handle(Command::CrawlNow).await;
        assert_eq!(tracker.accounter().total(), 5);

        let reopened = tracker_on(kv, 7).await;
        assert_eq!(reopened.accounter().total(), 5);
        assert_eq!(reopened.store().cache().len().unwrap(), 1);
    }
}
