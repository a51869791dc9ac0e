//! Tracks the set of outstanding activation deadlines for a workflow and
//! exposes their minimum, which becomes the persisted `next_activation_date`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Identifies one pending deadline within a workflow's [`ActivationDateTracker`].
/// Minted by the owning workflow; never compared across workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationHandle(u64);

/// Mints fresh, monotonically increasing [`ActivationHandle`]s for one workflow.
#[derive(Debug, Default)]
pub struct ActivationHandleAllocator(u64);

impl ActivationHandleAllocator {
    pub fn next(&mut self) -> ActivationHandle {
        let handle = ActivationHandle(self.0);
        self.0 += 1;
        handle
    }
}

/// Minimum-tracking set of (handle, deadline) pairs. Not thread-safe; callers
/// must only touch it from the owning workflow's serialized executor.
#[derive(Debug, Default)]
pub struct ActivationDateTracker {
    entries: HashMap<ActivationHandle, DateTime<Utc>>,
    min: Option<(ActivationHandle, DateTime<Utc>)>,
}

impl ActivationDateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `date` for `handle`. A `date` of [`DateTime::<Utc>::MAX_UTC`] is
    /// treated as "never" and ignored. Returns `true` if the overall minimum
    /// changed as a result.
    pub fn add(&mut self, handle: ActivationHandle, date: DateTime<Utc>) -> bool {
        if date == DateTime::<Utc>::MAX_UTC {
            return false;
        }
        self.entries.insert(handle, date);
        self.recompute_if_improved(handle, date)
    }

    /// Drop the entry for `handle`, recomputing the minimum if it was the
    /// removed entry. Returns `true` if the overall minimum changed.
    pub fn on_cancel(&mut self, handle: ActivationHandle) -> bool {
        if self.entries.remove(&handle).is_none() {
            return false;
        }
        match self.min {
            Some((min_handle, _)) if min_handle == handle => {
                self.min = self.entries.iter().map(|(&h, &d)| (h, d)).min_by_key(|&(_, d)| d);
                true
            }
            _ => false,
        }
    }

    /// The current minimum deadline, if any entries are outstanding.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.min.map(|(_, d)| d)
    }

    fn recompute_if_improved(&mut self, handle: ActivationHandle, date: DateTime<Utc>) -> bool {
        match self.min {
            Some((_, current_min)) if date < current_min => {
                self.min = Some((handle, date));
                true
            }
            None => {
                self.min = Some((handle, date));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(hour: u32) -> DateTime<Utc> {
        "2020-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap() + chrono::Duration::hours(hour as i64)
    }

    #[test]
    fn tracks_minimum_across_adds() {
        let mut tracker = ActivationDateTracker::new();
        let mut alloc = ActivationHandleAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        assert!(tracker.add(a, dt(10)));
        assert!(!tracker.add(b, dt(20)));
        assert_eq!(tracker.next(), Some(dt(10)));
    }

    #[test]
    fn recomputes_min_on_cancel_of_current_min() {
        let mut tracker = ActivationDateTracker::new();
        let mut alloc = ActivationHandleAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        tracker.add(a, dt(10));
        tracker.add(b, dt(20));
        assert!(tracker.on_cancel(a));
        assert_eq!(tracker.next(), Some(dt(20)));
    }

    #[test]
    fn cancel_of_non_min_does_not_change_min() {
        let mut tracker = ActivationDateTracker::new();
        let mut alloc = ActivationHandleAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        tracker.add(a, dt(10));
        tracker.add(b, dt(20));
        assert!(!tracker.on_cancel(b));
        assert_eq!(tracker.next(), Some(dt(10)));
    }

    #[test]
    fn never_date_is_ignored() {
        let mut tracker = ActivationDateTracker::new();
        let mut alloc = ActivationHandleAllocator::default();
        let a = alloc.next();
        assert!(!tracker.add(a, DateTime::<Utc>::MAX_UTC));
        assert_eq!(tracker.next(), None);
    }

    #[test]
    fn empty_tracker_has_no_next() {
        assert_eq!(ActivationDateTracker::new().next(), None);
    }
}
