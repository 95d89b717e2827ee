//! Synthetic workloads driving the runtime end to end.
//!
//! - [`stress`] hammers one ready stack from many threads and checks that
//!   every pushed value comes back exactly once.
//! - [`tiles`] runs a tiled update through the scheduler, moving each tile
//!   between the host and an accelerator through the coherency directory.

pub mod stress;
pub mod tiles;

pub use stress::{run_stress, StressConfig, StressReport};
pub use tiles::{run_tiles, TilesConfig, TilesReport};

use crate::runtime::data::DirectoryError;
use crate::runtime::memory::AllocError;
use crate::runtime::scheduler::SchedulerError;

/// Workload errors
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{failed} task(s) failed, first: {first}")]
    TaskFailed { failed: usize, first: String },
    #[error("{0}")]
    Corrupt(String),
}
