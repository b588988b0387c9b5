use std::collections::BTreeMap;

/// Tracks completed cursor ranges to provide safe resume points.
///
/// Parallel partitions may complete out of order. A resume point is only
/// reported up to the end of the contiguous run of completed ranges that
/// starts at the initial cursor, so resuming never skips unfinished records.
#[derive(Debug)]
pub struct RangeTracker {
    /// Completed ranges as end cursor keyed by start cursor.
    ranges: BTreeMap<u64, u64>,
    start: u64,
}

impl RangeTracker {
    pub fn new(start: u64) -> Self {
        Self {
            ranges: BTreeMap::new(),
            start,
        }
    }

    /// Record `[start, end)` as completed. Empty ranges are ignored.
    pub fn add_range(&mut self, start: u64, end: u64) {
        if end > start {
            self.ranges.insert(start, end);
        }
    }

    /// Cursor up to which every record has completed, or `None` if nothing
    /// past the start has.
    pub fn safe_resume_point(&self) -> Option<u64> {
        let mut current_end = self.start;
        for (&range_start, &range_end) in &self.ranges {
            if range_start > current_end {
                break;
            }
            if range_end > current_end {
                current_end = range_end;
            }
        }
        if current_end > self.start {
            Some(current_end)
        } else {
            None
        }
    }

    /// Safe resume point, or the start cursor.
    pub fn cursor(&self) -> u64 {
        self.safe_resume_point().unwrap_or(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let tracker = RangeTracker::new(0);
        assert_eq!(tracker.safe_resume_point(), None);
        assert_eq!(tracker.cursor(), 0);
    }

    #[test]
    fn test_contiguous_ranges() {
        let mut tracker = RangeTracker::new(0);
        tracker.add_range(0, 100);
        tracker.add_range(100, 200);
        tracker.add_range(200, 300);
        assert_eq!(tracker.safe_resume_point(), Some(300));
    }

    #[test]
    fn test_gap_holds_resume_point() {
        let mut tracker = RangeTracker::new(0);
        tracker.add_range(200, 300);
        assert_eq!(tracker.safe_resume_point(), None);

        tracker.add_range(0, 100);
        assert_eq!(tracker.safe_resume_point(), Some(100));

        tracker.add_range(100, 200);
        assert_eq!(tracker.safe_resume_point(), Some(300));
    }

    #[test]
    fn test_resumed_start() {
        let mut tracker = RangeTracker::new(500);
        tracker.add_range(600, 700);
        assert_eq!(tracker.cursor(), 500);
        tracker.add_range(500, 600);
        assert_eq!(tracker.cursor(), 700);
    }

    #[test]
    fn test_empty_range_ignored() {
        let mut tracker = RangeTracker::new(0);
        tracker.add_range(0, 0);
        assert_eq!(tracker.safe_resume_point(), None);
    }
}
