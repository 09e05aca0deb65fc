//! Closed-loop admission budget.

use serde::{Deserialize, Serialize};

/// Capacity the admission loop may spend on its next cycle.
///
/// The budget is spent in full by every admission and only refilled by the
/// drain loop as tags leave the subscription. Grants are capped so that
/// `available + subscribed` never exceeds `max_batch_size`, which keeps the
/// number of concurrently subscribed tags within the configured bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionBudget {
    available: usize,
    max_batch_size: usize,
}

impl AdmissionBudget {
    /// A full budget: nothing is subscribed when a run starts.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            available: max_batch_size,
            max_batch_size,
        }
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Spend the whole budget. Returns what was available.
    pub fn take(&mut self) -> usize {
        std::mem::take(&mut self.available)
    }

    /// Give back capacity that an admission took but could not use.
    pub fn restore(&mut self, unused: usize, subscribed: usize) {
        self.grant(unused, subscribed);
    }

    /// Add `retired` slots, bounded by the room left next to `subscribed`.
    /// Returns the new available amount.
    pub fn grant(&mut self, retired: usize, subscribed: usize) -> usize {
        let room = self.max_batch_size.saturating_sub(subscribed);
        self.available = self.available.saturating_add(retired).min(room);
        self.available
    }

    /// Refill to whatever room is left next to `subscribed`.
    pub fn fill(&mut self, subscribed: usize) -> usize {
        self.available = self.max_batch_size.saturating_sub(subscribed);
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_take_resets_to_zero() {
        let mut budget = AdmissionBudget::new(20);
        assert_eq!(budget.available(), 20);
        assert_eq!(budget.take(), 20);
        assert_eq!(budget.available(), 0);
        assert_eq!(budget.take(), 0);
    }

    #[test]
    fn grant_is_capped_by_free_room() {
        let mut budget = AdmissionBudget::new(10);
        budget.take();

        // 10 subscribed, 3 retired -> 7 still subscribed, room for 3.
        assert_eq!(budget.grant(3, 7), 3);
        // A second drain before the next admission accumulates.
        assert_eq!(budget.grant(2, 5), 5);
        // Never more than max_batch_size even if the caller over-reports.
        assert_eq!(budget.grant(50, 0), 10);
    }

    #[test]
    fn fill_honours_current_subscriptions() {
        let mut budget = AdmissionBudget::new(10);
        budget.take();
        assert_eq!(budget.fill(0), 10);
        budget.take();
        assert_eq!(budget.fill(4), 6);
    }

    #[test]
    fn budget_stays_within_bounds_under_arbitrary_sequences() {
        let max = 8;
        let mut budget = AdmissionBudget::new(max);
        let mut subscribed = 0usize;

        // Deterministic pseudo-random walk over admissions and retirements.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            match seed % 3 {
                0 => {
                    let admitted = budget.take();
                    subscribed += admitted;
                }
                1 => {
                    let retired = (seed as usize >> 8) % (subscribed + 1);
                    subscribed -= retired;
                    budget.grant(retired, subscribed);
                }
                _ => {
                    let unused = (seed as usize >> 16) % (max + 1);
                    budget.restore(unused, subscribed);
                }
            }
            assert!(budget.available() <= max);
            assert!(subscribed + budget.available() <= max);
        }
    }
}
