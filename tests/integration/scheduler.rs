use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera::runtime::scheduler::Scheduler;
use tessera::util::config::RuntimeConfig;
use tessera::workload::{run_tiles, TilesConfig};
use tessera::{LifoKind, RuntimeContext};

fn scheduler(lifo: LifoKind) -> Scheduler {
    let mut config = RuntimeConfig::from_toml(
        r#"
        [scheduler]
        num_workers = 4

        [arena]
        capacity = 2048

        [[devices]]
        name = "host"
        kind = "cpu"

        [[devices]]
        name = "gpu0"
        kind = "accelerator"
        memory_bytes = 4194304

        [[devices]]
        name = "gpu1"
        kind = "accelerator"
        memory_bytes = 4194304
        "#,
    )
    .unwrap();
    config.scheduler.lifo = lifo;
    config.validate().unwrap();

    let context = Arc::new(RuntimeContext::from_config(&config).unwrap());
    Scheduler::with_config(context, &config).unwrap()
}

#[test]
fn test_tiles_workload_on_both_variants() {
    for lifo in [LifoKind::Atomic, LifoKind::Locked] {
        let scheduler = scheduler(lifo);
        let report = run_tiles(
            &scheduler,
            &TilesConfig {
                tiles: 32,
                steps: 5,
                tile_size: 1024,
            },
        )
        .unwrap();

        assert_eq!(report.verified, 32);
        assert_eq!(report.transport.transfers, 64);
        assert_eq!(report.scheduler.tasks_completed, 32 * 6);
        assert_eq!(report.scheduler.tasks_failed, 0);
    }
}

#[test]
fn test_fan_out_fan_in() {
    let scheduler = scheduler(LifoKind::Atomic);
    let leaves = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        let leaves = leaves.clone();
        let root = scheduler.task("root", move |ctx| {
            let children: Vec<_> = (0..8)
                .map(|_| {
                    let leaves = leaves.clone();
                    tessera::runtime::scheduler::Task::new(ctx.next_id(), move |_| {
                        leaves.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();
            ctx.spawn_successors(children).unwrap();
        });
        scheduler.spawn(root).unwrap();
    }

    assert!(scheduler.wait_idle_timeout(Duration::from_secs(10)));
    assert_eq!(leaves.load(Ordering::SeqCst), 16 * 8);
    let stats = scheduler.stats().snapshot();
    assert_eq!(stats.tasks_scheduled, 16 * 9);
    assert_eq!(stats.chains_pushed, 16);
}
