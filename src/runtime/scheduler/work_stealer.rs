//! Work stealing for load balancing across worker threads.
//!
//! An idle worker pops from the top of a peer's ready stack. There is no
//! deque and no steal-half: the stacks are plain LIFOs, so a steal is just a
//! `pop` on someone else's stack.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::runtime::lifo::{Lifo, NodeHandle};

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal rounds.
    pub steal_failures: AtomicUsize,
    /// Total number of steal rounds.
    pub total_attempts: AtomicUsize,
    /// Victim stacks probed.
    pub victims_probed: AtomicUsize,
}

impl StealStats {
    /// Record a successful steal.
    #[inline]
    pub fn record_success(&self) {
        self.steal_successes.fetch_add(1, Ordering::Relaxed);
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed steal round.
    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::Relaxed);
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get success rate as a fraction.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let successes = self.steal_successes.load(Ordering::Relaxed);
        successes as f64 / total as f64
    }

    pub fn snapshot(&self) -> StealSnapshot {
        StealSnapshot {
            successes: self.steal_successes.load(Ordering::Relaxed),
            failures: self.steal_failures.load(Ordering::Relaxed),
            victims_probed: self.victims_probed.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
        }
    }
}

/// Point-in-time copy of [`StealStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StealSnapshot {
    pub successes: usize,
    pub failures: usize,
    pub victims_probed: usize,
    pub success_rate: f64,
}

/// How victims are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StealStrategy {
    /// Uniformly random peers.
    #[default]
    Random,
    /// Peers in ring order starting after the thief.
    Neighbor,
}

/// Steals ready tasks from peer stacks.
#[derive(Debug)]
pub struct WorkStealer {
    strategy: StealStrategy,
    attempts: usize,
    stats: StealStats,
}

impl WorkStealer {
    /// Probe at most `attempts` victims per steal round.
    pub fn new(
        strategy: StealStrategy,
        attempts: usize,
    ) -> Self {
        Self {
            strategy,
            attempts: attempts.max(1),
            stats: StealStats::default(),
        }
    }

    #[inline]
    pub fn strategy(&self) -> StealStrategy {
        self.strategy
    }

    /// One steal round on behalf of worker `thief`.
    pub fn steal<T, L>(
        &self,
        thief: usize,
        stacks: &[L],
    ) -> Option<NodeHandle>
    where
        L: Lifo<T>,
    {
        let workers = stacks.len();
        if workers < 2 {
            return None;
        }

        let mut rng = rand::rng();
        for attempt in 0..self.attempts {
            let offset = match self.strategy {
                StealStrategy::Random => rng.random_range(1..workers),
                StealStrategy::Neighbor => attempt % (workers - 1) + 1,
            };
            let victim = (thief + offset) % workers;
            self.stats.victims_probed.fetch_add(1, Ordering::Relaxed);

            if let Some(handle) = stacks[victim].pop() {
                self.stats.record_success();
                return Some(handle);
            }
        }

        self.stats.record_failure();
        None
    }

    /// Get steal statistics.
    #[inline]
    pub fn stats(&self) -> &StealStats {
        &self.stats
    }
}
