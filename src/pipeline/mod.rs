//! Entry points driving the tracker.
//!
//! - `Tracker`: validated command handling over the store and crawl engine
//! - `run_daemon`: background crawling plus a JSON-lines command channel

mod commands;
mod daemon;

pub use commands::Tracker;
pub use daemon::run_daemon;
