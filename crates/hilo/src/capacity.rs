//! Adaptive range sizing
//!
//! Frequent refills grow the range so fewer round trips are needed; rare
//! refills shrink it back so fewer keys are wasted when a client goes away.
//!
//! | Time since previous refill | Time since the one before | New capacity |
//! |---|---|---|
//! | < 5s | < 3s | capacity × 4 |
//! | < 5s | ≥ 3s | capacity × 2 |
//! | > 60s | - | max(base, capacity / 2) |
//! | otherwise | - | unchanged |

/// Refills closer than this grow the capacity
pub const FAST_REFILL_MS: u64 = 5_000;
/// Two refills within this window grow it faster
pub const BURST_REFILL_MS: u64 = 3_000;
/// Refills further apart than this shrink the capacity
pub const IDLE_REFILL_MS: u64 = 60_000;

/// Capacity state of one generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPolicy {
    base: u64,
    capacity: u64,
    last_refill: Option<u64>,
    previous_refill: Option<u64>,
    disabled: bool,
}

impl CapacityPolicy {
    /// Policy starting at `base`, which is also the floor
    pub fn new(base: u64) -> Self {
        let base = base.max(1);
        CapacityPolicy {
            base,
            capacity: base,
            last_refill: None,
            previous_refill: None,
            disabled: false,
        }
    }

    /// Policy that never changes capacity
    pub fn fixed(base: u64) -> Self {
        CapacityPolicy {
            disabled: true,
            ..Self::new(base)
        }
    }

    /// Current capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Floor
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Record a refill at `now` and return the capacity to reserve
    ///
    /// A missing previous refill counts as "long ago".
    pub fn on_refill(&mut self, now: u64) -> u64 {
        if self.disabled {
            return self.capacity;
        }

        let since_last = self.last_refill.map(|t| now.saturating_sub(t));
        let since_previous = self.previous_refill.map(|t| now.saturating_sub(t));

        match since_last {
            Some(span) if span < FAST_REFILL_MS => {
                let factor = match since_previous {
                    Some(span2) if span2 < BURST_REFILL_MS => 4,
                    _ => 2,
                };
                self.capacity = self.capacity.saturating_mul(factor);
            }
            Some(span) if span <= IDLE_REFILL_MS => {}
            _ => {
                self.capacity = self.base.max(self.capacity / 2);
            }
        }

        self.previous_refill = self.last_refill;
        self.last_refill = Some(now);
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_refill_keeps_base() {
        let mut policy = CapacityPolicy::new(32);
        assert_eq!(policy.on_refill(0), 32);
    }

    #[test]
    fn fast_refills_double_then_quadruple() {
        let mut policy = CapacityPolicy::new(32);
        policy.on_refill(0);
        // 4s after the last, nothing before that
        assert_eq!(policy.on_refill(4_000), 64);
        // 1s after the last, 5s after the one before
        assert_eq!(policy.on_refill(5_000), 128);
        // 1s after the last, 2s after the one before
        assert_eq!(policy.on_refill(6_000), 512);
    }

    #[test]
    fn idle_refills_halve_down_to_base() {
        let mut policy = CapacityPolicy::new(32);
        policy.on_refill(0);
        policy.on_refill(100);
        policy.on_refill(200);
        assert_eq!(policy.capacity(), 256);

        assert_eq!(policy.on_refill(100_000), 128);
        assert_eq!(policy.on_refill(200_000), 64);
        assert_eq!(policy.on_refill(300_000), 32);
        assert_eq!(policy.on_refill(400_000), 32);
    }

    #[test]
    fn moderate_spacing_is_stable() {
        let mut policy = CapacityPolicy::new(32);
        policy.on_refill(0);
        assert_eq!(policy.on_refill(30_000), 32);
        assert_eq!(policy.on_refill(60_000), 32);
    }

    #[test]
    fn fixed_policy_never_changes() {
        let mut policy = CapacityPolicy::fixed(16);
        for t in [0, 10, 20, 30] {
            assert_eq!(policy.on_refill(t), 16);
        }
    }

    #[test]
    fn capacity_saturates() {
        let mut policy = CapacityPolicy::new(u64::MAX / 2);
        policy.on_refill(0);
        policy.on_refill(1);
        assert_eq!(policy.on_refill(2), u64::MAX);
    }
}
