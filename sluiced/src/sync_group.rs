//! Adaptive SYNC group sizing.
//!
//! Contiguous SYNC events may be applied as one group. The group size
//! adapts so one apply lands near the desired processing time: after a
//! fast apply the group may grow, after a slow one it shrinks, always
//! within `[1, sync_group_maxsize]`.

use std::time::Duration;

/// Tracks the current group size for one origin.
#[derive(Debug, Clone)]
pub struct SyncGroupSizer {
    max: u32,
    desired: Duration,
    current: u32,
}

impl SyncGroupSizer {
    /// Start at a single SYNC per group.
    pub fn new(max: u32, desired: Duration) -> Self {
        Self {
            max: max.max(1),
            desired,
            current: 1,
        }
    }

    /// The size to use for the next group.
    pub fn next_size(&self) -> u32 {
        self.current
    }

    /// Record an apply of `applied` SYNCs that took `elapsed`.
    pub fn observe(&mut self, applied: u32, elapsed: Duration) {
        if self.desired.is_zero() {
            // No target: always use the configured maximum
            self.current = self.max;
            return;
        }
        if elapsed < self.desired / 2 {
            // Only grow when the group was actually filled; a half-empty
            // group finishing early says nothing about capacity
            if applied >= self.current {
                self.current = (self.current + 1).min(self.max);
            }
        } else if elapsed > self.desired {
            self.current = (self.current / 2).max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_on_fast_full_groups() {
        let mut sizer = SyncGroupSizer::new(6, Duration::from_millis(1000));
        for _ in 0..10 {
            let size = sizer.next_size();
            sizer.observe(size, Duration::from_millis(100));
        }
        assert_eq!(sizer.next_size(), 6);
    }

    #[test]
    fn test_shrinks_on_slow_groups() {
        let mut sizer = SyncGroupSizer::new(6, Duration::from_millis(1000));
        for _ in 0..10 {
            let size = sizer.next_size();
            sizer.observe(size, Duration::from_millis(100));
        }
        sizer.observe(6, Duration::from_millis(5000));
        assert_eq!(sizer.next_size(), 3);
        sizer.observe(3, Duration::from_millis(5000));
        assert_eq!(sizer.next_size(), 1);
        // Never below 1
        sizer.observe(1, Duration::from_millis(5000));
        assert_eq!(sizer.next_size(), 1);
    }

    #[test]
    fn test_partial_group_does_not_grow() {
        let mut sizer = SyncGroupSizer::new(6, Duration::from_millis(1000));
        sizer.observe(0, Duration::from_millis(1));
        assert_eq!(sizer.next_size(), 1);
    }

    #[test]
    fn test_zero_target_uses_max() {
        let mut sizer = SyncGroupSizer::new(6, Duration::ZERO);
        sizer.observe(1, Duration::from_millis(100));
        assert_eq!(sizer.next_size(), 6);
    }

    #[test]
    fn test_middle_band_is_stable() {
        let mut sizer = SyncGroupSizer::new(6, Duration::from_millis(1000));
        sizer.observe(1, Duration::from_millis(700));
        assert_eq!(sizer.next_size(), 1);
    }
}
