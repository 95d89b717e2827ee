//! Multi-threaded push/pop stress over a single stack.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use super::WorkloadError;
use crate::runtime::lifo::{AnyLifo, Lifo, LifoKind, NodeArena};

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub threads: usize,
    /// Values each thread pushes per round.
    pub items: usize,
    pub rounds: usize,
    /// Push in chains of this length; 1 pushes single nodes.
    pub chain_len: usize,
    pub lifo: LifoKind,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            items: 1000,
            rounds: 10,
            chain_len: 1,
            lifo: LifoKind::Atomic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressReport {
    pub lifo: LifoKind,
    pub threads: usize,
    pub pushed: u64,
    pub popped: u64,
    /// Values left on the stack after all threads finished.
    pub drained: u64,
    /// Every pushed value came back exactly once.
    pub conserved: bool,
    pub elapsed_ms: u128,
    pub ops_per_sec: f64,
}

#[derive(Debug, Default)]
struct Tally {
    pushed: u64,
    pushed_sum: u64,
    popped: u64,
    popped_sum: u64,
}

impl Tally {
    fn record_push(
        &mut self,
        value: u64,
    ) {
        self.pushed += 1;
        self.pushed_sum = self.pushed_sum.wrapping_add(value);
    }

    fn record_pop(
        &mut self,
        value: u64,
    ) {
        self.popped += 1;
        self.popped_sum = self.popped_sum.wrapping_add(value);
    }
}

/// Run the stress test. Each thread pushes `items` values per round and
/// then pops as many as it can find; leftovers are drained at the end.
pub fn run_stress(config: &StressConfig) -> Result<StressReport, WorkloadError> {
    let threads = config.threads.max(1);
    let chain_len = config.chain_len.max(1);
    // A thread's live values span at most its current round and the one
    // before, plus a chain being built and a popped node not yet freed.
    let capacity = threads * (2 * config.items + chain_len + 1) + 1;
    let arena = Arc::new(NodeArena::<u64>::with_capacity(capacity)?);
    let stack = AnyLifo::new(config.lifo, arena.clone())?;
    let barrier = Barrier::new(threads);

    info!(
        lifo = %config.lifo,
        threads,
        items = config.items,
        rounds = config.rounds,
        chain_len,
        "stress started"
    );
    let start = Instant::now();

    let tallies = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let stack = &stack;
                let arena = &arena;
                let barrier = &barrier;
                thread::Builder::new()
                    .name(format!("stress-{t}"))
                    .spawn_scoped(scope, move || {
                        barrier.wait();
                        hammer(t as u64, config, chain_len, arena, stack)
                    })
            })
            .collect();

        workers
            .into_iter()
            .map(|spawned| {
                let handle = spawned.map_err(|e| WorkloadError::Corrupt(format!("spawn failed: {e}")))?;
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect::<Result<Vec<_>, WorkloadError>>()
    })?;
    let elapsed = start.elapsed();

    let mut total = Tally::default();
    for tally in &tallies {
        total.pushed += tally.pushed;
        total.pushed_sum = total.pushed_sum.wrapping_add(tally.pushed_sum);
        total.popped += tally.popped;
        total.popped_sum = total.popped_sum.wrapping_add(tally.popped_sum);
    }

    let mut drained = 0;
    while let Some(handle) = stack.pop() {
        total.record_pop(arena.free(handle));
        drained += 1;
    }

    let conserved = total.pushed == total.popped && total.pushed_sum == total.popped_sum;
    let ops = (total.pushed + total.popped) as f64;
    let secs = elapsed.as_secs_f64();
    let report = StressReport {
        lifo: config.lifo,
        threads,
        pushed: total.pushed,
        popped: total.popped,
        drained,
        conserved,
        elapsed_ms: elapsed.as_millis(),
        ops_per_sec: if secs > 0.0 { ops / secs } else { 0.0 },
    };
    info!(
        pushed = report.pushed,
        popped = report.popped,
        drained,
        conserved,
        "stress finished"
    );
    Ok(report)
}

fn hammer(
    thread: u64,
    config: &StressConfig,
    chain_len: usize,
    arena: &NodeArena<u64>,
    stack: &AnyLifo<u64>,
) -> Result<Tally, WorkloadError> {
    let mut tally = Tally::default();
    let mut seq = 0u64;

    for round in 0..config.rounds {
        let mut remaining = config.items;
        while remaining > 0 {
            let batch = remaining.min(chain_len);
            let mut next_value = || {
                let value = (thread << 32) | seq;
                seq += 1;
                value
            };
            if batch == 1 {
                let value = next_value();
                stack.push(arena.alloc(value)?);
                tally.record_push(value);
            } else {
                let mut chain = arena.chain();
                for _ in 0..batch {
                    let value = next_value();
                    chain.append(arena.alloc(value)?);
                    tally.record_push(value);
                }
                stack.push_chain(chain);
            }
            remaining -= batch;
        }

        for _ in 0..config.items {
            match stack.pop() {
                Some(handle) => tally.record_pop(arena.free(handle)),
                None => break,
            }
        }
        debug!(thread, round, "stress round done");
    }
    Ok(tally)
}
