//! Service layer for the tracker.
//!
//! This module contains the business logic for:
//! - Conflict-safe entry persistence (`EntryStore`)
//! - The in-memory entry mirror (`EntryCache`)
//! - Unread total accounting (`UnreadAccounter`)
//! - Reply polling (`CrawlEngine`) and remote counters (`ReplyCounter`)

mod crawler;
mod entry_cache;
mod entry_store;
pub mod reconcile;
mod replies;
mod unread;

pub use crawler::{CrawlEngine, CrawlSwitch, CycleReport};
pub use entry_cache::EntryCache;
pub use entry_store::{EntryStore, PutOutcome};
pub use reconcile::{Reconciliation, reconcile, reconcile_entry};
pub use replies::{HttpReplyCounter, ReplyCounter};
pub use unread::{Divergence, LogSink, UnreadAccounter, UnreadSink};
