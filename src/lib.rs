// src/lib.rs

//! Reply tracker library
//!
//! Keeps a local set of watched forum entries, polls their reply counters and
//! maintains a running total of unread replies.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
