// src/services/reconcile.rs

//! Unread delta calculation.
//!
//! Compares the last observed reply counter of an entry with a freshly
//! observed one and derives the new unread count. Growth accumulates on top
//! of whatever is still unread; a counter that went backwards never pushes
//! the unread count below zero.

use crate::models::TrackedEntry;

/// Counters after reconciling an entry with a remote observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub reply_count: u64,
    pub unread_count: u64,
    /// Signed change of the unread count
    pub unread_delta: i64,
    /// Whether either counter differs from the previous state
    pub changed: bool,
}

impl Reconciliation {
    /// Write the reconciled counters into `entry`.
    pub fn apply_to(&self, entry: &mut TrackedEntry) {
        entry.reply_count = self.reply_count;
        entry.unread_count = self.unread_count;
    }
}

/// Reconcile previous counters with a remote reply count.
pub fn reconcile(previous_reply: u64, previous_unread: u64, remote: u64) -> Reconciliation {
    let grown = i128::from(remote) - i128::from(previous_reply) + i128::from(previous_unread);
    let unread_count = u64::try_from(grown.max(0)).unwrap_or(u64::MAX);
    let unread_delta = i128::from(unread_count) - i128::from(previous_unread);

    Reconciliation {
        reply_count: remote,
        unread_count,
        unread_delta: unread_delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64,
        changed: remote != previous_reply || unread_count != previous_unread,
    }
}

/// Reconcile an entry's current counters with a remote reply count.
pub fn reconcile_entry(entry: &TrackedEntry, remote: u64) -> Reconciliation {
    reconcile(entry.reply_count, entry.unread_count, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_changes() {
        let result = reconcile(5, 2, 5);
        assert!(!result.changed);
        assert_eq!(result.unread_count, 2);
        assert_eq!(result.unread_delta, 0);
    }

    #[test]
    fn test_growth_adds_to_unread() {
        let result = reconcile(5, 2, 8);
        assert!(result.changed);
        assert_eq!(result.reply_count, 8);
        assert_eq!(result.unread_count, 5);
        assert_eq!(result.unread_delta, 3);
    }

    #[test]
    fn test_accumulates_across_cycles() {
        let first = reconcile(10, 5, 12);
        assert_eq!(first.unread_count, 7);

        let second = reconcile(first.reply_count, first.unread_count, 15);
        assert_eq!(second.unread_count, 10);
        assert_eq!(second.unread_delta, 3);
    }

    #[test]
    fn test_regression_clamps_to_zero() {
        let result = reconcile(8, 0, 6);
        assert!(result.changed);
        assert_eq!(result.reply_count, 6);
        assert_eq!(result.unread_count, 0);
        assert_eq!(result.unread_delta, 0);
    }

    #[test]
    fn test_regression_eats_into_unread() {
        let result = reconcile(8, 3, 6);
        assert_eq!(result.unread_count, 1);
        assert_eq!(result.unread_delta, -2);
    }

    #[test]
    fn test_apply_to_entry() {
        let mut entry = TrackedEntry::new("1", "2", 5);
        entry.unread_count = 2;

        let result = reconcile_entry(&entry, 8);
        result.apply_to(&mut entry);
        assert_eq!((entry.reply_count, entry.unread_count), (8, 5));
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let result = reconcile(0, u64::MAX, u64::MAX);
        assert_eq!(result.unread_count, u64::MAX);
        assert_eq!(result.unread_delta, 0);
    }
}
