//! Tiled update workload through the scheduler and the coherency directory.
//!
//! Every tile starts on the host. Each step is one task: it pulls the tile
//! onto its accelerator (a read transfer when the accelerator copy is stale),
//! takes write ownership there and bumps every byte. The step then pushes
//! the next step as its successor. The last step reads the tile back on the
//! host and checks the bytes.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::WorkloadError;
use crate::runtime::data::{
    CopyRef, DataCollection, DataKey, DataObject, DirectoryError, LocalTransport, ReadAccess,
    TransportStats,
};
use crate::runtime::device::{DeviceIndex, DeviceKind, DeviceRegistry};
use crate::runtime::scheduler::{Scheduler, StatsSnapshot, StealSnapshot, TaskBuilder, TaskContext};

#[derive(Debug, Clone)]
pub struct TilesConfig {
    pub tiles: usize,
    /// Update steps per tile.
    pub steps: usize,
    /// Bytes per tile.
    pub tile_size: usize,
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            tiles: 64,
            steps: 8,
            tile_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TilesReport {
    pub tiles: usize,
    pub steps: usize,
    pub verified: usize,
    pub elapsed_ms: u128,
    pub transport: TransportStats,
    pub scheduler: StatsSnapshot,
    pub steal: StealSnapshot,
}

/// Shared by every task of one run.
struct Run {
    collection: DataCollection,
    host: DeviceIndex,
    accelerators: Vec<DeviceIndex>,
    steps: usize,
    verified: Mutex<usize>,
    failures: Mutex<Vec<String>>,
}

impl Run {
    fn device_for(
        &self,
        key: DataKey,
    ) -> DeviceIndex {
        if self.accelerators.is_empty() {
            return self.host;
        }
        self.accelerators[key.0 as usize % self.accelerators.len()]
    }

    fn fail(
        &self,
        key: DataKey,
        message: String,
    ) {
        warn!(%key, %message, "tile step failed");
        self.failures.lock().push(format!("{key}: {message}"));
    }
}

/// Seed tiles on the host and run `steps` updates per tile on `scheduler`.
pub fn run_tiles(
    scheduler: &Scheduler,
    config: &TilesConfig,
) -> Result<TilesReport, WorkloadError> {
    let devices = scheduler.context().devices().clone();
    let (host, accelerators) = split_devices(&devices)?;

    let run = Arc::new(Run {
        collection: DataCollection::new("tiles", config.tile_size, devices),
        host,
        accelerators,
        steps: config.steps,
        verified: Mutex::new(0),
        failures: Mutex::new(Vec::new()),
    });

    info!(
        tiles = config.tiles,
        steps = config.steps,
        tile_size = config.tile_size,
        accelerators = run.accelerators.len(),
        "tiles started"
    );
    let before = scheduler.context().transport().stats();
    let start = Instant::now();

    for tile in 0..config.tiles {
        let key = DataKey(tile as u64);
        let seed = vec![seed_byte(key); config.tile_size];
        run.collection.insert_tile(key, host, &seed)?;

        let run = run.clone();
        let task = scheduler.task(format!("{key}/step0"), move |ctx| step(ctx, run, key, 0));
        scheduler.spawn(task)?;
    }

    scheduler.wait_idle();
    let elapsed = start.elapsed();

    let failures = std::mem::take(&mut *run.failures.lock());
    if let Some(first) = failures.first() {
        return Err(WorkloadError::TaskFailed {
            failed: failures.len(),
            first: first.clone(),
        });
    }
    let verified = *run.verified.lock();
    if verified != config.tiles {
        return Err(WorkloadError::Corrupt(format!(
            "{verified} of {} tiles verified",
            config.tiles
        )));
    }

    let after = scheduler.context().transport().stats();
    let report = TilesReport {
        tiles: config.tiles,
        steps: config.steps,
        verified,
        elapsed_ms: elapsed.as_millis(),
        transport: TransportStats {
            transfers: after.transfers - before.transfers,
            bytes_moved: after.bytes_moved - before.bytes_moved,
        },
        scheduler: scheduler.stats().snapshot(),
        steal: scheduler.steal_stats().snapshot(),
    };
    info!(
        verified,
        transfers = report.transport.transfers,
        bytes = report.transport.bytes_moved,
        "tiles finished"
    );
    Ok(report)
}

fn split_devices(devices: &DeviceRegistry) -> Result<(DeviceIndex, Vec<DeviceIndex>), WorkloadError> {
    let host = devices
        .iter()
        .find(|device| device.kind() == DeviceKind::Cpu)
        .map(|device| device.index())
        .ok_or_else(|| WorkloadError::Corrupt("no host device registered".to_string()))?;
    let accelerators = devices
        .iter()
        .filter(|device| device.kind() == DeviceKind::Accelerator)
        .map(|device| device.index())
        .collect();
    Ok((host, accelerators))
}

fn seed_byte(key: DataKey) -> u8 {
    key.0 as u8
}

fn step(
    ctx: &TaskContext<'_>,
    run: Arc<Run>,
    key: DataKey,
    index: usize,
) {
    let Some(object) = run.collection.get(key) else {
        run.fail(key, "tile missing".to_string());
        return;
    };
    let transport = ctx.runtime().transport();

    if index == run.steps {
        match verify(transport, &object, run.host, run.steps) {
            Ok(()) => *run.verified.lock() += 1,
            Err(message) => run.fail(key, message),
        }
        return;
    }

    let device = run.device_for(key);
    if let Err(err) = update(transport, &object, device) {
        run.fail(key, err.to_string());
        return;
    }
    debug!(%key, step = index, worker = ctx.worker_id(), "tile updated");

    let next = {
        let run = run.clone();
        TaskBuilder::new()
            .name(format!("{key}/step{}", index + 1))
            .build(ctx.next_id(), move |ctx| step(ctx, run, key, index + 1))
    };
    if let Err(err) = ctx.spawn_successors([next]) {
        run.fail(key, err.to_string());
    }
}

/// Bring `device` up to date, then own it and bump every byte.
fn update(
    transport: &LocalTransport,
    object: &Arc<DataObject>,
    device: DeviceIndex,
) -> Result<(), DirectoryError> {
    drop(read_current(transport, object, device)?);
    let copy = object.acquire_for_write(device)?;
    let mut bytes = copy.bytes_mut()?;
    for byte in bytes.iter_mut() {
        *byte = byte.wrapping_add(1);
    }
    Ok(())
}

fn verify(
    transport: &LocalTransport,
    object: &Arc<DataObject>,
    host: DeviceIndex,
    steps: usize,
) -> Result<(), String> {
    let copy = read_current(transport, object, host).map_err(|err| err.to_string())?;
    let expected = seed_byte(object.key()).wrapping_add(steps as u8);
    let bytes = copy
        .bytes()
        .ok_or_else(|| "host copy has no buffer".to_string())?;
    match bytes.iter().position(|&b| b != expected) {
        None => Ok(()),
        Some(at) => Err(format!(
            "byte {at} is {} after {steps} steps, expected {expected}",
            bytes[at]
        )),
    }
}

/// Read access on `device`, driving any transfer it needs.
fn read_current(
    transport: &LocalTransport,
    object: &Arc<DataObject>,
    device: DeviceIndex,
) -> Result<CopyRef, DirectoryError> {
    loop {
        match object.acquire_for_read(device)? {
            ReadAccess::Ready(copy) => return Ok(copy),
            ReadAccess::Pending(request) => {
                if !transport.drive(request)? {
                    thread::yield_now();
                }
            }
        }
    }
}
