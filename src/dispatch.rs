//! Moderator selection for new-request tasks.
//!
//! Every new application needs moderators to act on it. Which moderators get
//! the action e-mail is configuration-driven: either every configured
//! moderator (`Broadcast`) or a uniformly random subset (`Random`) to spread
//! review load across a larger team.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

/// How action e-mails are fanned out to moderators.
///
/// Configuration values other than these fail deserialization, which fails
/// startup before any message is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DispatchStrategy {
    /// Every configured moderator, in configured order.
    Broadcast,

    /// A uniformly shuffled subset of at most `random_threshold` moderators.
    Random,
}

/// Selects which moderators receive action e-mails for a new request.
#[derive(Debug, Clone)]
pub struct OpDispatcher {
    strategy: DispatchStrategy,
    ops: Vec<String>,
    threshold: usize,
}

impl OpDispatcher {
    pub fn new(strategy: DispatchStrategy, ops: Vec<String>, threshold: usize) -> Self {
        Self {
            strategy,
            ops,
            threshold,
        }
    }

    /// Select target moderators using fresh entropy.
    pub fn select(&self) -> Vec<String> {
        self.select_with(&mut rand::thread_rng())
    }

    /// Select target moderators with a caller-supplied RNG.
    ///
    /// Production goes through [`select`](Self::select); tests inject a
    /// seeded RNG to make the subset reproducible.
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        match self.strategy {
            DispatchStrategy::Broadcast => self.ops.clone(),
            DispatchStrategy::Random => {
                let mut ops = self.ops.clone();
                ops.shuffle(rng);
                // A threshold past the end takes the whole shuffled list
                ops.truncate(self.threshold);
                ops
            }
        }
    }
}
