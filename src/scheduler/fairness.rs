//! Per-tier starvation guard.
//!
//! Each tier keeps a counter of consecutive scheduling rounds in which it had
//! waiting requests but contributed nothing to the batch. Once a tier has been
//! skipped `R - 1` rounds it is due, and the next round's batch is led by the
//! oldest request of every due tier. A request at the head of its tier is
//! therefore batched within `R` rounds no matter how much higher-priority
//! work keeps arriving or how many other tiers are starving at the same time.

use crate::sequence::Priority;

#[derive(Debug, Clone)]
pub struct StarvationGuard {
    rounds: u32,
    skipped: [u32; 4],
}

impl StarvationGuard {
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds: rounds.max(1),
            skipped: [0; 4],
        }
    }

    /// Tiers that must lead the next batch, most urgent first.
    pub fn due(&self, waiting: &[bool; 4]) -> Vec<Priority> {
        Priority::ALL
            .into_iter()
            .filter(|t| waiting[t.level() as usize])
            .filter(|t| self.skipped[t.level() as usize] + 1 >= self.rounds)
            .collect()
    }

    /// Update counters after a round. `waiting` is the set of tiers that had
    /// queued work when the round started.
    pub fn record_round(&mut self, waiting: &[bool; 4], contributed: &[bool; 4]) {
        for tier in 0..4 {
            if contributed[tier] || !waiting[tier] {
                self.skipped[tier] = 0;
            } else {
                self.skipped[tier] += 1;
            }
        }
    }

    pub fn skipped(&self, tier: Priority) -> u32 {
        self.skipped[tier.level() as usize]
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW_WAITING: [bool; 4] = [true, false, false, true];
    const HIGH_ONLY: [bool; 4] = [true, false, false, false];

    #[test]
    fn test_due_after_r_minus_one_skips() {
        let mut guard = StarvationGuard::new(3);
        assert!(guard.due(&LOW_WAITING).is_empty());

        guard.record_round(&LOW_WAITING, &HIGH_ONLY);
        assert!(guard.due(&LOW_WAITING).is_empty());

        guard.record_round(&LOW_WAITING, &HIGH_ONLY);
        assert_eq!(guard.skipped(Priority::Low), 2);
        assert_eq!(guard.due(&LOW_WAITING), vec![Priority::Low]);
    }

    #[test]
    fn test_counter_resets_on_contribution() {
        let mut guard = StarvationGuard::new(3);
        guard.record_round(&LOW_WAITING, &HIGH_ONLY);
        guard.record_round(&LOW_WAITING, &LOW_WAITING);
        assert_eq!(guard.skipped(Priority::Low), 0);
        assert_eq!(guard.skipped(Priority::Critical), 0);
    }

    #[test]
    fn test_idle_tiers_never_due() {
        let mut guard = StarvationGuard::new(2);
        guard.record_round(&HIGH_ONLY, &[false; 4]);
        assert_eq!(guard.skipped(Priority::Critical), 1);
        assert_eq!(guard.skipped(Priority::Low), 0);
        assert_eq!(guard.due(&HIGH_ONLY), vec![Priority::Critical]);
        assert!(guard.due(&[false; 4]).is_empty());
    }

    #[test]
    fn test_every_waiting_tier_due_with_single_round() {
        let guard = StarvationGuard::new(1);
        assert_eq!(guard.due(&LOW_WAITING), vec![Priority::Critical, Priority::Low]);
    }

    #[test]
    fn test_all_starving_tiers_due_together() {
        let mut guard = StarvationGuard::new(2);
        let all = [true; 4];
        guard.record_round(&[true, false, true, true], &[true, false, false, false]);
        guard.record_round(&all, &[true, false, false, false]);
        assert_eq!(
            guard.due(&all),
            vec![Priority::High, Priority::Normal, Priority::Low]
        );
    }
}
