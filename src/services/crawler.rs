// src/services/crawler.rs

//! Reply crawl engine.
//!
//! One cycle walks the cached entries strictly in order, fetches each
//! entry's remote reply count, and persists reconciled counters through the
//! [`EntryStore`]. Requests are spaced by the active delay. The crawl switch
//! is honoured before each entry and after each delay; an in-flight fetch
//! always completes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::models::{CrawlerConfig, TrackedEntry};
use crate::services::reconcile::reconcile_entry;
use crate::services::{EntryStore, PutOutcome, ReplyCounter};

/// Shared on/off switch for crawling.
#[derive(Debug, Clone)]
pub struct CrawlSwitch {
    state: Arc<watch::Sender<bool>>,
}

impl CrawlSwitch {
    pub fn new(enabled: bool) -> Self {
        let (state, _) = watch::channel(enabled);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.state.borrow()
    }

    /// Set the switch. Returns whether the value changed.
    pub fn set(&self, enabled: bool) -> bool {
        self.state.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        })
    }

    /// Resolve once crawling is enabled.
    pub async fn wait_enabled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|enabled| *enabled).await;
    }
}

impl Default for CrawlSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Summary of one crawl cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Entries whose remote count was requested
    pub processed: usize,
    /// Entries whose new counters were persisted
    pub updated: usize,
    pub skipped_stale: usize,
    pub fetch_failures: usize,
    /// Writes refused because a newer record existed
    pub rejected: usize,
    /// Writes that failed after retries
    pub write_failures: usize,
    /// Net unread change applied by this cycle
    pub unread_delta: i64,
    /// Stopped early by the crawl switch or a cache failure
    pub aborted: bool,
    /// Another cycle was already running; nothing was done
    pub overlapped: bool,
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Poll loop over the tracked entries.
pub struct CrawlEngine {
    store: Arc<EntryStore>,
    counter: Arc<dyn ReplyCounter>,
    switch: CrawlSwitch,
    settings: CrawlerConfig,
    in_progress: AtomicBool,
}

impl CrawlEngine {
    pub fn new(
        store: Arc<EntryStore>,
        counter: Arc<dyn ReplyCounter>,
        switch: CrawlSwitch,
        settings: CrawlerConfig,
    ) -> Self {
        Self {
            store,
            counter,
            switch,
            settings,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn switch(&self) -> &CrawlSwitch {
        &self.switch
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one crawl cycle over a snapshot of the cache.
    ///
    /// Returns immediately with `overlapped` set if a cycle is in progress.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Crawl cycle already running; request ignored");
            report.overlapped = true;
            return report;
        }
        let _guard = CycleGuard(&self.in_progress);

        let entries = match self.store.cache().get_all() {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Abandoning crawl cycle: {e}");
                report.aborted = true;
                return report;
            }
        };

        let now = Utc::now();
        let delay = self.settings.active_delay();
        let mut pending = entries.into_iter().peekable();

        while let Some(entry) = pending.next() {
            if !self.switch.is_enabled() {
                report.aborted = true;
                break;
            }
            if entry.is_stale(now, self.settings.stale_after_days) {
                log::debug!("Skipping {}: posted {:?}", entry.key(), entry.posted_at);
                report.skipped_stale += 1;
                continue;
            }

            report.processed += 1;
            self.reconcile(entry, &mut report).await;

            if pending.peek().is_some() {
                tokio::time::sleep(delay).await;
                if !self.switch.is_enabled() {
                    report.aborted = true;
                    break;
                }
            }
        }

        log::info!(
            "Crawl cycle: {} checked, {} updated, {} stale, {} fetch failures, {} rejected, {} write failures{}",
            report.processed,
            report.updated,
            report.skipped_stale,
            report.fetch_failures,
            report.rejected,
            report.write_failures,
            if report.aborted { " (stopped early)" } else { "" }
        );
        report
    }

    /// Poll forever, pacing cycles by whether they found anything.
    pub async fn run(&self) {
        loop {
            if !self.switch.is_enabled() {
                log::info!("Crawling disabled; waiting to be re-enabled");
                self.switch.wait_enabled().await;
                log::info!("Crawling re-enabled");
            }

            let report = self.run_cycle().await;
            let pause = if report.updated > 0 {
                self.settings.active_delay()
            } else {
                self.settings.idle_delay()
            };
            log::debug!("Next crawl cycle in {pause:?}");
            tokio::time::sleep(pause).await;
        }
    }

    async fn reconcile(&self, entry: TrackedEntry, report: &mut CycleReport) {
        let key = entry.key();
        let Some(remote) = self
            .counter
            .fetch_reply_count(&entry.topic_id, &entry.entry_id)
            .await
        else {
            log::warn!("No reply count for {key}; will retry next cycle");
            report.fetch_failures += 1;
            return;
        };

        let outcome = reconcile_entry(&entry, remote);
        if !outcome.changed {
            return;
        }

        let mut updated = entry;
        outcome.apply_to(&mut updated);
        match self.store.put(updated).await {
            Ok(PutOutcome::Written(written)) => {
                if written.version == 1 {
                    log::debug!("{key} was removed while its count was fetched; tracking it again");
                }
                log::info!(
                    "{key}: {} replies, {} unread ({:+})",
                    written.reply_count,
                    written.unread_count,
                    outcome.unread_delta
                );
                report.updated += 1;
                report.unread_delta += outcome.unread_delta;
            }
            Ok(PutOutcome::Stale { .. }) => {
                report.rejected += 1;
            }
            Err(e) => {
                log::warn!("Could not persist {key}: {e}");
                report.write_failures += 1;
            }
        }
    }
}
