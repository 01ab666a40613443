//! Backoff for the send retry loop.

use std::time::Duration;

use xxhash_rust::xxh3::xxh3_64;

/// Upper bound on the per-chain stagger offset, in milliseconds.
const MAX_STAGGER_MS: u64 = 128;

/// Doublings beyond this no longer grow the delay; the budget cap has
/// long taken over by then.
const MAX_DOUBLINGS: u32 = 16;

/// Delay policy for re-attempting a failed send within one flush.
///
/// Delays double from `initial`, but every single wait is capped at a
/// quarter of the flush's time budget (and at `ceiling`), so a send that
/// keeps failing still gets several attempts before the flush deadline
/// instead of sleeping through it. Each integration chain carries a
/// deterministic stagger offset derived from its chain key, so the
/// integrations of one receiver do not retry against a shared endpoint
/// in lockstep.
#[derive(Debug, Clone)]
pub struct SendBackoff {
    initial: Duration,
    ceiling: Duration,
    stagger: Duration,
}

impl SendBackoff {
    /// A doubling backoff between `initial` and `ceiling`.
    #[must_use]
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            stagger: Duration::ZERO,
        }
    }

    /// A flat delay, for tests and local setups.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// A copy of this policy carrying the stagger offset for `chain_key`
    /// (the receiver/integration/index key the chain deduplicates
    /// under).
    #[must_use]
    pub fn staggered_for(&self, chain_key: &str) -> Self {
        let mut out = self.clone();
        out.stagger = Duration::from_millis(xxh3_64(chain_key.as_bytes()) % MAX_STAGGER_MS);
        out
    }

    /// The delay before the given zero-based retry attempt, inside a
    /// flush with the given time budget.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, budget: Duration) -> Duration {
        // A quarter of the budget bounds every wait; the floor keeps a
        // degenerate budget from spinning the retry loop hot.
        let cap = self
            .ceiling
            .min(budget / 4)
            .max(Duration::from_millis(1));
        let doubled = self.initial.saturating_mul(1 << attempt.min(MAX_DOUBLINGS));
        (doubled + self.stagger).min(cap)
    }
}

impl Default for SendBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_budget_cap() {
        let backoff = SendBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        let budget = Duration::from_secs(1);
        assert_eq!(backoff.delay_for(0, budget), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1, budget), Duration::from_millis(200));
        assert_eq!(
            backoff.delay_for(2, budget),
            Duration::from_millis(250),
            "capped at a quarter of the budget"
        );
        assert_eq!(backoff.delay_for(9, budget), Duration::from_millis(250));
    }

    #[test]
    fn ceiling_holds_under_generous_budgets() {
        let backoff = SendBackoff::new(Duration::from_secs(1), Duration::from_secs(2));
        let budget = Duration::from_secs(60);
        assert_eq!(backoff.delay_for(0, budget), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(3, budget), Duration::from_secs(2));
    }

    #[test]
    fn fixed_is_flat() {
        let backoff = SendBackoff::fixed(Duration::from_millis(5));
        for attempt in 0..8 {
            assert_eq!(
                backoff.delay_for(attempt, Duration::from_secs(10)),
                Duration::from_millis(5)
            );
        }
    }

    #[test]
    fn tiny_budget_still_schedules_retries() {
        let backoff = SendBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        let delay = backoff.delay_for(0, Duration::from_millis(2));
        assert!(delay > Duration::ZERO, "retry loop must not spin hot");
        assert!(delay <= Duration::from_millis(1));
    }

    #[test]
    fn stagger_is_deterministic_and_never_defeats_the_cap() {
        let base = SendBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        let chain = base.staggered_for("pager/email/0");
        let again = base.staggered_for("pager/email/0");
        let budget = Duration::from_secs(60);

        assert_eq!(chain.delay_for(0, budget), again.delay_for(0, budget));
        assert!(chain.delay_for(0, budget) >= base.delay_for(0, budget));
        assert!(
            chain.delay_for(0, budget) < base.delay_for(0, budget) + Duration::from_millis(MAX_STAGGER_MS)
        );

        // The budget cap wins over the stagger offset.
        let tight = Duration::from_millis(400);
        assert!(chain.delay_for(9, tight) <= Duration::from_millis(100));
    }
}
