//! Reserved key ranges
//!
//! A range is never mutated after creation apart from its cursor. Refills
//! build a fresh [`RangeValue`] and swap the shared pointer, so a racing
//! reader sees either the old, exhausted range or the new one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bounds `[min, max]` and the last dispensed value
#[derive(Debug)]
pub struct RangeValue {
    min: u64,
    max: u64,
    current: AtomicU64,
    server_prefix: String,
}

impl RangeValue {
    /// Range `[min, max]` with nothing dispensed yet
    pub fn new(min: u64, max: u64) -> Self {
        Self::with_prefix(min, max, String::new())
    }

    /// Range whose generated keys embed `server_prefix`
    pub fn with_prefix(min: u64, max: u64, server_prefix: String) -> Self {
        RangeValue {
            min,
            max,
            current: AtomicU64::new(min.saturating_sub(1)),
            server_prefix,
        }
    }

    /// The initial range `[1, 0]`: exhausted before the first call
    pub fn empty() -> Self {
        RangeValue::new(1, 0)
    }

    /// Lower bound
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Last dispensed value (`min - 1` before the first)
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Server prefix fetched with this range
    pub fn server_prefix(&self) -> &str {
        &self.server_prefix
    }

    /// Dispense the next value, or `None` once the range is used up
    ///
    /// Losers of a race past `max` still advance the cursor; that is harmless
    /// because an exhausted range is replaced, never reused.
    pub fn next(&self) -> Option<u64> {
        let value = self.current.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if value >= self.min && value <= self.max {
            Some(value)
        } else {
            None
        }
    }

    /// True once every value has been dispensed
    pub fn is_exhausted(&self) -> bool {
        self.current() >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_range_is_exhausted() {
        let range = RangeValue::empty();
        assert!(range.is_exhausted());
        assert_eq!(range.next(), None);
    }

    #[test]
    fn test_dispenses_each_value_once() {
        let range = RangeValue::new(5, 7);
        assert_eq!(range.current(), 4);
        assert_eq!(range.next(), Some(5));
        assert_eq!(range.next(), Some(6));
        assert_eq!(range.next(), Some(7));
        assert!(range.is_exhausted());
        assert_eq!(range.next(), None);
        assert_eq!(range.next(), None);
    }

    #[test]
    fn test_prefix_is_kept() {
        let range = RangeValue::with_prefix(1, 2, "A-".to_string());
        assert_eq!(range.server_prefix(), "A-");
    }
}
