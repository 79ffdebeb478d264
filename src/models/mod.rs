// src/models/mod.rs

//! Domain models for the tracker.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod command;
mod config;
mod entry;

// Re-export all public types
pub use command::{
    ClearUnreadRequest, Command, CommandResponse, EntryRef, SwitchRequest, TopicRef,
    UpsertRequest,
};
pub use config::{Config, CrawlerConfig, SiteConfig, StorageConfig};
pub use entry::{ENTRY_PREFIX, EntryKey, TrackedEntry, excerpt, parse_posted_at};
