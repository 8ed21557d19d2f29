//! Promotion policy: where a read hit should be copied to.
//!
//! A policy only chooses a target level. The orchestrator drops any answer
//! that would demote or overshoot the hottest tier, so a policy can never
//! break the "promotion only moves up, never past the top" rule.

use std::fmt;

/// Chooses the promotion target for a segment hit.
pub trait PromotionPolicy: Send + Sync + fmt::Debug {
    /// Level to copy a segment found at `hit_level` into, if any.
    /// `top_level` is the hottest level of the cache.
    fn target(&self, hit_level: usize, top_level: usize) -> Option<usize>;
}

/// Promote exactly one level on every hit. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneLevelUp;

impl PromotionPolicy for OneLevelUp {
    fn target(&self, hit_level: usize, top_level: usize) -> Option<usize> {
        (hit_level < top_level).then_some(hit_level + 1)
    }
}

/// Copy every hit straight into the hottest tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToTop;

impl PromotionPolicy for ToTop {
    fn target(&self, hit_level: usize, top_level: usize) -> Option<usize> {
        (hit_level < top_level).then_some(top_level)
    }
}

/// Never promote; residency only changes through writes and eviction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPromotion;

impl PromotionPolicy for NoPromotion {
    fn target(&self, _hit_level: usize, _top_level: usize) -> Option<usize> {
        None
    }
}

/// Apply `policy` and discard targets outside `(hit_level, top_level]`.
pub fn checked_target(
    policy: &dyn PromotionPolicy,
    hit_level: usize,
    top_level: usize,
) -> Option<usize> {
    policy
        .target(hit_level, top_level)
        .filter(|&target| target > hit_level && target <= top_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Broken(usize);

    impl PromotionPolicy for Broken {
        fn target(&self, _hit_level: usize, _top_level: usize) -> Option<usize> {
            Some(self.0)
        }
    }

    #[test]
    fn test_one_level_up() {
        assert_eq!(OneLevelUp.target(0, 2), Some(1));
        assert_eq!(OneLevelUp.target(1, 2), Some(2));
        assert_eq!(OneLevelUp.target(2, 2), None);
    }

    #[test]
    fn test_to_top() {
        assert_eq!(ToTop.target(0, 3), Some(3));
        assert_eq!(ToTop.target(3, 3), None);
    }

    #[test]
    fn test_checked_target_rejects_demotion_and_overshoot() {
        assert_eq!(checked_target(&Broken(0), 1, 2), None);
        assert_eq!(checked_target(&Broken(1), 1, 2), None);
        assert_eq!(checked_target(&Broken(5), 1, 2), None);
        assert_eq!(checked_target(&Broken(2), 1, 2), Some(2));
        assert_eq!(checked_target(&NoPromotion, 0, 2), None);
    }
}
