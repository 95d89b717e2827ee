use std::sync::Arc;
use std::thread;

use tessera::workload::{run_stress, StressConfig};
use tessera::{AnyLifo, AtomicLifo, Lifo, LifoKind, LockedLifo, NodeArena};

#[test]
fn test_stress_both_variants() {
    for lifo in [LifoKind::Atomic, LifoKind::Locked] {
        for chain_len in [1, 4] {
            let report = run_stress(&StressConfig {
                threads: 8,
                items: 300,
                rounds: 4,
                chain_len,
                lifo,
            })
            .unwrap();
            assert!(report.conserved, "{lifo} chain_len={chain_len}: {report:?}");
            assert_eq!(report.pushed, 8 * 300 * 4);
            assert_eq!(report.popped, report.pushed);
        }
    }
}

#[test]
fn test_stacks_share_one_arena() {
    let arena = Arc::new(NodeArena::with_capacity(16).unwrap());
    let atomic = AtomicLifo::new(arena.clone()).unwrap();
    let locked = LockedLifo::new(arena.clone()).unwrap();
    assert_eq!(arena.len(), 2);

    atomic.push(arena.alloc("moved").unwrap());
    let handle = atomic.pop().unwrap();
    locked.push(handle);
    assert!(atomic.is_empty());

    let handle = locked.pop().unwrap();
    assert_eq!(arena.free(handle), "moved");
}

#[test]
fn test_producers_and_consumers() {
    let arena = Arc::new(NodeArena::with_capacity(4097).unwrap());
    let stack = Arc::new(AnyLifo::new(LifoKind::Atomic, arena.clone()).unwrap());

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let stack = stack.clone();
            thread::spawn(move || {
                for i in 0..1024u64 {
                    let handle = stack.arena().alloc(p * 1024 + i).unwrap();
                    stack.push(handle);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let stack = stack.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                while got.len() < 1024 {
                    match stack.pop() {
                        Some(handle) => got.push(stack.arena().free(handle)),
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let mut all: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..4096).collect::<Vec<_>>());
    assert_eq!(arena.len(), 1);
}
